use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::warn;

use crate::fs_stat::{self, DiskSpace};

/// How long a path stays ineligible after a failed transfer.
pub const PAUSE_INTERVAL: Duration = Duration::from_secs(5 * 60);

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// One managed directory on a filesystem.
///
/// A destination path is owned exclusively by the transfer that picked it,
/// for the whole receive-plus-move pipeline; `busy` is both the cheap
/// negative filter for pick walks and the non-blocking admission, acquired
/// with a compare-and-swap. Cache paths are never acquired, they only carry
/// the in-flight `transfers` counter used to spread load.
pub struct PlotPath {
    path: PathBuf,

    busy: AtomicBool,

    /// Pause deadline, milliseconds since the unix epoch. The path is
    /// paused while the deadline lies in the future. Extending with
    /// `fetch_max` coalesces overlapping pauses so the path never
    /// un-pauses before the latest deadline.
    paused_until: AtomicU64,

    free_space: AtomicU64,
    total_space: AtomicU64,

    /// In-flight transfer count. Only meaningful for cache paths.
    transfers: AtomicI64,
}

impl PlotPath {
    pub fn new(path: PathBuf, space: DiskSpace) -> Self {
        Self {
            path,
            busy: AtomicBool::new(false),
            paused_until: AtomicU64::new(0),
            free_space: AtomicU64::new(space.free),
            total_space: AtomicU64::new(space.total),
            transfers: AtomicI64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn free_space(&self) -> u64 {
        self.free_space.load(Ordering::Relaxed)
    }

    pub fn total_space(&self) -> u64 {
        self.total_space.load(Ordering::Relaxed)
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Relaxed)
    }

    pub fn transfers(&self) -> i64 {
        self.transfers.load(Ordering::Relaxed)
    }

    pub fn inc_transfers(&self) {
        self.transfers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_transfers(&self) {
        self.transfers.fetch_sub(1, Ordering::Relaxed);
    }

    /// Refresh free and total bytes from the filesystem. This should be
    /// done after every transfer that touches the path. A probe error is
    /// logged and both values are left unchanged.
    pub fn update_free_space(&self) {
        match fs_stat::disk_space(&self.path) {
            Ok(space) => {
                self.total_space.store(space.total, Ordering::Relaxed);
                self.free_space.store(space.free, Ordering::Relaxed);
            }
            Err(e) => {
                warn!(
                    "Failed to stat {}, keeping previous space values: {}",
                    self.path.display(),
                    e
                );
            }
        }
    }

    /// Temporarily stop selecting this path for new transfers. Used when
    /// storing a plot fails; the issue may be intermittent, so the path
    /// becomes eligible again after [`PAUSE_INTERVAL`].
    pub fn pause(&self) {
        self.pause_for(PAUSE_INTERVAL);
    }

    pub fn pause_for(&self, interval: Duration) {
        let deadline = now_millis() + interval.as_millis() as u64;
        self.paused_until.fetch_max(deadline, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        now_millis() < self.paused_until.load(Ordering::Relaxed)
    }

    /// Claim the path exclusively for one transfer. Fails immediately when
    /// the path is paused or another transfer already owns it; the caller
    /// closes the connection and lets the producer retry elsewhere.
    pub fn try_acquire(self: &Arc<Self>) -> Option<PathGuard> {
        if self.is_paused() {
            return None;
        }

        self.busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()?;

        Some(PathGuard {
            path: Arc::clone(self),
        })
    }
}

/// Exclusive ownership of a destination path, released on drop.
pub struct PathGuard {
    path: Arc<PlotPath>,
}

impl PathGuard {
    pub fn path(&self) -> &Arc<PlotPath> {
        &self.path
    }
}

impl Drop for PathGuard {
    fn drop(&mut self) {
        self.path.busy.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs_stat::disk_space;
    use std::thread;

    fn test_path(free: u64, total: u64) -> Arc<PlotPath> {
        Arc::new(PlotPath::new(
            PathBuf::from("/plots/a"),
            DiskSpace { free, total },
        ))
    }

    #[test]
    fn test_try_acquire_is_exclusive() {
        let path = test_path(100, 200);

        let guard = path.try_acquire().unwrap();
        assert!(path.is_busy());
        assert!(path.try_acquire().is_none());

        drop(guard);
        assert!(!path.is_busy());
        assert!(path.try_acquire().is_some());
    }

    #[test]
    fn test_paused_path_is_not_acquirable() {
        let path = test_path(100, 200);

        path.pause_for(Duration::from_millis(200));
        assert!(path.is_paused());
        assert!(path.try_acquire().is_none());

        thread::sleep(Duration::from_millis(250));
        assert!(!path.is_paused());
        assert!(path.try_acquire().is_some());
    }

    #[test]
    fn test_pause_deadlines_coalesce() {
        let path = test_path(100, 200);

        path.pause_for(Duration::from_millis(300));
        // A shorter overlapping pause must not shorten the window.
        path.pause_for(Duration::from_millis(10));

        thread::sleep(Duration::from_millis(100));
        assert!(path.is_paused());
    }

    #[test]
    fn test_update_free_space_invariant() {
        let dir = tempfile::tempdir().unwrap();
        let space = disk_space(dir.path()).unwrap();

        let path = Arc::new(PlotPath::new(dir.path().to_path_buf(), space));
        path.update_free_space();

        assert!(path.free_space() <= path.total_space());
    }

    #[test]
    fn test_update_free_space_error_keeps_values() {
        let path = test_path(42, 100);
        // "/plots/a" does not exist, the probe fails.
        path.update_free_space();

        assert_eq!(path.free_space(), 42);
        assert_eq!(path.total_space(), 100);
    }

    #[test]
    fn test_transfer_counter() {
        let path = test_path(0, 0);

        path.inc_transfers();
        path.inc_transfers();
        assert_eq!(path.transfers(), 2);

        path.dec_transfers();
        assert_eq!(path.transfers(), 1);
    }
}
