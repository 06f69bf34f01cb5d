use std::io::{self, Read};

use likely_stable::unlikely;

/// Go-ahead byte sent to the producer once placement has succeeded.
pub const ACK: u8 = 1;

/// Longest accepted filename, in bytes. One path component.
pub const MAX_FILENAME_LEN: usize = 255;

/// Decode the 8-byte little-endian plot size prefix.
pub fn decode_u64_le(b: [u8; 8]) -> u64 {
    u64::from_le_bytes(b)
}

/// Decode the 2-byte little-endian filename length.
///
/// The field is signed on the wire; values `1..=32767` are meaningful,
/// everything else is rejected by the caller.
pub fn decode_i16_le(b: [u8; 2]) -> i16 {
    i16::from_le_bytes(b)
}

/// Read the fixed size prefix from `r`.
pub fn read_size<R: Read>(r: &mut R) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(decode_u64_le(buf))
}

/// Read the fixed filename length prefix from `r`.
pub fn read_filename_len<R: Read>(r: &mut R) -> io::Result<i16> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)?;
    Ok(decode_i16_le(buf))
}

/// Read a filename of `len` bytes from `r` and validate it as a single
/// path component.
pub fn read_filename<R: Read>(r: &mut R, len: usize) -> io::Result<String> {
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;

    let name = String::from_utf8(buf)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    if unlikely(!is_valid_filename(&name)) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("filename {:?} is not a plain path component", name),
        ));
    }

    Ok(name)
}

/// A filename must be a single non-empty path component: no separators, no
/// traversal, no NUL, at most [`MAX_FILENAME_LEN`] bytes.
pub fn is_valid_filename(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_FILENAME_LEN {
        return false;
    }
    if name == "." || name == ".." {
        return false;
    }
    !name.contains(['/', '\\', '\0'])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_u64_le() {
        assert_eq!(decode_u64_le([0; 8]), 0);
        assert_eq!(decode_u64_le([1, 0, 0, 0, 0, 0, 0, 0]), 1);
        assert_eq!(decode_u64_le([0, 1, 0, 0, 0, 0, 0, 0]), 256);
        assert_eq!(decode_u64_le([0xff; 8]), u64::MAX);

        // 108 GiB, a realistic plot size
        let size: u64 = 108 * 1024 * 1024 * 1024;
        assert_eq!(decode_u64_le(size.to_le_bytes()), size);
    }

    #[test]
    fn test_decode_i16_le() {
        assert_eq!(decode_i16_le([0, 0]), 0);
        assert_eq!(decode_i16_le([3, 0]), 3);
        assert_eq!(decode_i16_le([0xff, 0x7f]), 32767);
        assert_eq!(decode_i16_le([0xff, 0xff]), -1);
    }

    #[test]
    fn test_read_size_short_input() {
        let mut short: &[u8] = &[1, 2, 3];
        assert!(read_size(&mut short).is_err());

        let mut full: &[u8] = &[8, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(read_size(&mut full).unwrap(), 8);
    }

    #[test]
    fn test_is_valid_filename() {
        assert!(is_valid_filename("plot-k32-0001.plot"));
        assert!(is_valid_filename("p01"));

        assert!(!is_valid_filename(""));
        assert!(!is_valid_filename("."));
        assert!(!is_valid_filename(".."));
        assert!(!is_valid_filename("../escape"));
        assert!(!is_valid_filename("a/b"));
        assert!(!is_valid_filename("a\\b"));
        assert!(!is_valid_filename("a\0b"));
        assert!(!is_valid_filename(&"x".repeat(MAX_FILENAME_LEN + 1)));
        assert!(is_valid_filename(&"x".repeat(MAX_FILENAME_LEN)));
    }

    #[test]
    fn test_read_filename_rejects_separators() {
        let mut data: &[u8] = b"../../etc/passwd";
        assert!(read_filename(&mut data, 16).is_err());

        let mut ok: &[u8] = b"p01";
        assert_eq!(read_filename(&mut ok, 3).unwrap(), "p01");
    }
}
