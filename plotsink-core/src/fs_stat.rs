use std::io;
use std::path::Path;

/// Available and total bytes of the filesystem backing a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskSpace {
    pub free: u64,
    pub total: u64,
}

/// Query the filesystem for available and total bytes at `path`.
///
/// `free` is the space available to unprivileged writers, so it never
/// exceeds `total`.
pub fn disk_space(path: &Path) -> io::Result<DiskSpace> {
    let free = fs2::available_space(path)?;
    let total = fs2::total_space(path)?;
    Ok(DiskSpace { free, total })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_space_of_tempdir() {
        let dir = tempfile::tempdir().unwrap();
        let space = disk_space(dir.path()).unwrap();

        assert!(space.total > 0);
        assert!(space.free <= space.total);
    }

    #[test]
    fn test_disk_space_missing_path() {
        assert!(disk_space(Path::new("/nonexistent/plotsink")).is_err());
    }
}
