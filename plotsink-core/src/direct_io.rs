use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;
use std::ptr::NonNull;

/// Block alignment for direct I/O. 4 KiB satisfies every targeted
/// filesystem.
pub const ALIGNMENT: usize = 4096;

/// Staging buffer size. Must be a multiple of [`ALIGNMENT`].
const BUF_LEN: usize = 4 * 1024 * 1024;

/// Heap allocation aligned for direct I/O.
///
/// The kernel rejects unaligned buffers on an `O_DIRECT` descriptor, so the
/// staging buffer cannot be a plain `Vec`.
struct AlignedBuf {
    ptr: NonNull<u8>,
    len: usize,
}

// Sole owner of its allocation; moves between threads are fine.
unsafe impl Send for AlignedBuf {}

impl AlignedBuf {
    fn new(len: usize) -> Self {
        assert!(len > 0 && len % ALIGNMENT == 0);

        let layout = Layout::from_size_align(len, ALIGNMENT).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).unwrap_or_else(|| std::alloc::handle_alloc_error(layout));

        Self { ptr, len }
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.len, ALIGNMENT).unwrap();
        unsafe { dealloc(self.ptr.as_ptr(), layout) };
    }
}

/// Open `path` exclusively for writing with the platform's direct-I/O hint.
///
/// The file must not already exist. Filesystems without direct I/O support
/// (tmpfs among them) refuse the flag at open time; those fall back to a
/// buffered descriptor, since the flag is a page-cache hint rather than a
/// correctness requirement.
fn open_direct_create(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);

    #[cfg(target_os = "linux")]
    {
        use std::os::unix::fs::OpenOptionsExt;

        let mut direct = OpenOptions::new();
        direct
            .write(true)
            .create_new(true)
            .custom_flags(libc::O_DIRECT);

        match direct.open(path) {
            Ok(file) => return Ok(file),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Err(e),
            Err(e) => {
                // The open may have created the inode before rejecting
                // O_DIRECT; clear it so the exclusive retry can succeed.
                let _ = std::fs::remove_file(path);
                log::warn!(
                    "Direct I/O unavailable at {}, using buffered writes: {}",
                    path.display(),
                    e
                );
            }
        }
    }

    options.open(path)
}

/// Block-aligned writer for streaming one plot to disk.
///
/// Data is staged through an aligned buffer and written in full-buffer
/// blocks. The final partial block is zero-padded to the alignment, written,
/// and the file is then truncated to the exact logical length.
pub struct DirectWriter {
    file: File,
    buf: AlignedBuf,
    filled: usize,
    logical: u64,
}

impl DirectWriter {
    /// Create the destination file exclusively and wrap it for aligned
    /// writes.
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = open_direct_create(path)?;

        Ok(Self {
            file,
            buf: AlignedBuf::new(BUF_LEN),
            filled: 0,
            logical: 0,
        })
    }

    /// Bytes accepted so far.
    pub fn bytes_written(&self) -> u64 {
        self.logical
    }

    fn flush_full_buffer(&mut self) -> io::Result<()> {
        self.file.write_all(&self.buf.as_slice()[..self.filled])?;
        self.filled = 0;
        Ok(())
    }

    /// Copy `reader` to the file until EOF, returning the number of bytes
    /// copied by this call.
    pub fn copy_from<R: Read>(&mut self, reader: &mut R) -> io::Result<u64> {
        let mut copied = 0u64;

        loop {
            if self.filled == self.buf.len {
                self.flush_full_buffer()?;
            }

            let spare = &mut self.buf.as_mut_slice()[self.filled..];
            let n = match reader.read(spare) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };

            self.filled += n;
            self.logical += n as u64;
            copied += n as u64;
        }

        Ok(copied)
    }

    /// Write the padded tail, truncate to the logical length and close.
    ///
    /// Returns the total number of bytes the file holds.
    pub fn finish(mut self) -> io::Result<u64> {
        if self.filled > 0 {
            let padded = self.filled.div_ceil(ALIGNMENT) * ALIGNMENT;
            self.buf.as_mut_slice()[self.filled..padded].fill(0);
            self.filled = padded;
            self.flush_full_buffer()?;
        }

        self.file.set_len(self.logical)?;
        Ok(self.logical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_aligned_buf_alignment() {
        let buf = AlignedBuf::new(BUF_LEN);
        assert_eq!(buf.as_slice().as_ptr() as usize % ALIGNMENT, 0);
        assert_eq!(buf.as_slice().len(), BUF_LEN);
    }

    #[test]
    fn test_write_unaligned_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plot.tmp");

        // 2.5 blocks, so the tail needs padding and truncation.
        let data: Vec<u8> = (0..ALIGNMENT * 5 / 2).map(|i| (i % 251) as u8).collect();

        let mut writer = DirectWriter::create(&path).unwrap();
        let copied = writer.copy_from(&mut Cursor::new(&data)).unwrap();
        assert_eq!(copied, data.len() as u64);
        assert_eq!(writer.bytes_written(), data.len() as u64);

        let total = writer.finish().unwrap();
        assert_eq!(total, data.len() as u64);

        let back = std::fs::read(&path).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_write_exact_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plot.tmp");

        let data = vec![0xabu8; ALIGNMENT * 3];

        let mut writer = DirectWriter::create(&path).unwrap();
        writer.copy_from(&mut Cursor::new(&data)).unwrap();
        writer.finish().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), data);
    }

    #[test]
    fn test_empty_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plot.tmp");

        let mut writer = DirectWriter::create(&path).unwrap();
        writer.copy_from(&mut Cursor::new(&[] as &[u8])).unwrap();
        assert_eq!(writer.finish().unwrap(), 0);

        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn test_create_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plot.tmp");

        let _writer = DirectWriter::create(&path).unwrap();
        let second = DirectWriter::create(&path);
        assert!(second.is_err());
    }
}
