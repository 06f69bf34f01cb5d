use std::fs;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use log::{info, warn};

use crate::config::GroupConfig;
use crate::fs_stat;
use crate::plot_path::PlotPath;

/// Role of a group, fixed at construction. The role determines which sort
/// order `resort` maintains and whether `pick` gives up early on size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    /// Fast staging paths, ordered by in-flight transfers ascending so
    /// writes spread across devices.
    Cache,
    /// Bulk destination paths, ordered by free space descending for
    /// wear-leveling and predictable fill.
    Destination,
}

/// A named, ordered collection of plot paths sharing a concurrency budget.
/// One group models one controller channel, or the cache tier.
pub struct PlotGroup {
    name: String,
    kind: GroupKind,
    concurrency: i64,

    /// In-flight transfers charged to this group.
    transfers: AtomicI64,

    /// Kept sorted according to `kind`. Picks take the read lock, re-sorts
    /// take the write lock.
    sorted_plots: RwLock<Vec<Arc<PlotPath>>>,
}

impl PlotGroup {
    /// Build a group from already-registered paths. Unless
    /// `allow_excess_concurrency` is set, the budget is capped at the
    /// number of paths, since a destination disk takes one transfer at a
    /// time.
    pub fn new(
        name: &str,
        kind: GroupKind,
        concurrency: i64,
        plots: Vec<Arc<PlotPath>>,
        allow_excess_concurrency: bool,
    ) -> Self {
        let mut concurrency = concurrency;
        if !allow_excess_concurrency && concurrency > plots.len() as i64 {
            concurrency = plots.len() as i64;
        }

        let group = Self {
            name: name.to_string(),
            kind,
            concurrency,
            transfers: AtomicI64::new(0),
            sorted_plots: RwLock::new(plots),
        };
        group.resort();

        info!(
            "Plot group {:?} ready with concurrency {}.",
            group.name, group.concurrency
        );

        group
    }

    /// Expand and validate a configured group. Each paths entry is treated
    /// as a glob; matches must be directories, must not carry the
    /// skip-directory marker, and must answer a free-space probe. Anything
    /// else is skipped with a log line.
    pub fn from_config(
        name: &str,
        cfg: &GroupConfig,
        kind: GroupKind,
        skip_file: Option<&str>,
        allow_excess_concurrency: bool,
    ) -> Self {
        let mut plots = Vec::new();

        for pattern in &cfg.paths {
            let matches = match glob::glob(pattern) {
                Ok(matches) => matches,
                Err(e) => {
                    warn!("Path {} failed globbing, skipping: {}", pattern, e);
                    continue;
                }
            };

            for entry in matches {
                let path = match entry {
                    Ok(path) => path,
                    Err(e) => {
                        warn!("Glob match under {} unreadable, skipping: {}", pattern, e);
                        continue;
                    }
                };

                let path = match path.canonicalize() {
                    Ok(path) => path,
                    Err(e) => {
                        warn!("Path {} failed expansion, skipping: {}", path.display(), e);
                        continue;
                    }
                };

                match fs::metadata(&path) {
                    Ok(meta) if meta.is_dir() => {}
                    Ok(_) => {
                        warn!("Path {} is not a directory, skipping", path.display());
                        continue;
                    }
                    Err(e) => {
                        warn!("Path {} failed validation, skipping: {}", path.display(), e);
                        continue;
                    }
                }

                if let Some(skip) = skip_file {
                    if path.join(skip).exists() {
                        info!(
                            "Path {} carries {}, treating as unmounted and skipping",
                            path.display(),
                            skip
                        );
                        continue;
                    }
                }

                let space = match fs_stat::disk_space(&path) {
                    Ok(space) => space,
                    Err(e) => {
                        warn!("Path {} failed free space probe, skipping: {}", path.display(), e);
                        continue;
                    }
                };

                info!(
                    "Registered plot path: {} [{} free / {} total bytes]",
                    path.display(),
                    space.free,
                    space.total
                );

                plots.push(Arc::new(PlotPath::new(path, space)));
            }
        }

        Self::new(name, kind, cfg.concurrency, plots, allow_excess_concurrency)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> GroupKind {
        self.kind
    }

    pub fn concurrency(&self) -> i64 {
        self.concurrency
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

    pub fn is_empty(&self) -> bool {
        self.sorted_plots.read().unwrap().is_empty()
    }

    /// Snapshot of the current path order.
    pub fn plots(&self) -> Vec<Arc<PlotPath>> {
        self.sorted_plots.read().unwrap().clone()
    }

    /// Return the path most suitable for a new transfer of `size` bytes.
    ///
    /// Admission is checked first: a group at its concurrency budget
    /// returns nothing immediately. The walk skips busy and paused paths.
    /// Destination groups are ordered by free space descending, so the
    /// first candidate that cannot fit the stream ends the walk; nothing
    /// after it can fit either. Cache groups take the first eligible path,
    /// they are provisioned to fit the current stream.
    pub fn pick(&self, size: u64) -> Option<Arc<PlotPath>> {
        if self.transfers.load(Ordering::Relaxed) >= self.concurrency {
            return None;
        }

        let plots = self.sorted_plots.read().unwrap();
        for plot in plots.iter() {
            if plot.is_busy() {
                continue;
            }
            if plot.is_paused() {
                continue;
            }

            match self.kind {
                GroupKind::Destination => {
                    if size > plot.free_space() {
                        return None;
                    }
                    return Some(Arc::clone(plot));
                }
                GroupKind::Cache => return Some(Arc::clone(plot)),
            }
        }
        None
    }

    /// Re-sort by free space descending. Destination order; call after a
    /// transfer updates a member's free space.
    pub fn resort_by_free_space(&self) {
        let mut plots = self.sorted_plots.write().unwrap();
        plots.sort_by(|a, b| b.free_space().cmp(&a.free_space()));
    }

    /// Re-sort by in-flight transfers ascending. Cache order; call after a
    /// transfer updates a member's counter.
    pub fn resort_by_transfers(&self) {
        let mut plots = self.sorted_plots.write().unwrap();
        plots.sort_by_key(|plot| plot.transfers());
    }

    /// Re-sort in the order this group's role prescribes.
    pub fn resort(&self) {
        match self.kind {
            GroupKind::Cache => self.resort_by_transfers(),
            GroupKind::Destination => self.resort_by_free_space(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs_stat::DiskSpace;
    use std::path::PathBuf;

    fn path_with_free(name: &str, free: u64) -> Arc<PlotPath> {
        Arc::new(PlotPath::new(
            PathBuf::from(format!("/plots/{}", name)),
            DiskSpace { free, total: 1 << 40 },
        ))
    }

    fn destination_group(frees: &[(&str, u64)], concurrency: i64) -> PlotGroup {
        let plots = frees.iter().map(|(n, f)| path_with_free(n, *f)).collect();
        PlotGroup::new("sas0", GroupKind::Destination, concurrency, plots, false)
    }

    #[test]
    fn test_pick_orders_by_free_space() {
        let group = destination_group(&[("a", 100), ("b", 500), ("c", 300)], 3);

        let picked = group.pick(50).unwrap();
        assert_eq!(picked.path(), PathBuf::from("/plots/b"));
    }

    #[test]
    fn test_pick_admission_bound() {
        let group = destination_group(&[("a", 100), ("b", 100)], 1);

        assert!(group.pick(10).is_some());

        group.inc_transfers();
        assert!(group.pick(10).is_none());

        group.dec_transfers();
        assert!(group.pick(10).is_some());
    }

    #[test]
    fn test_pick_skips_busy_and_paused() {
        let group = destination_group(&[("a", 500), ("b", 400), ("c", 300)], 3);
        let plots = group.plots();

        let _guard = plots[0].try_acquire().unwrap();
        plots[1].pause_for(std::time::Duration::from_secs(60));

        let picked = group.pick(50).unwrap();
        assert_eq!(picked.path(), PathBuf::from("/plots/c"));
    }

    #[test]
    fn test_pick_gives_up_when_largest_cannot_fit() {
        let group = destination_group(&[("a", 100), ("b", 500)], 2);

        // b leads the order; if even b cannot fit, a cannot either.
        assert!(group.pick(501).is_none());
    }

    #[test]
    fn test_pick_accepts_exact_fit() {
        let group = destination_group(&[("a", 500)], 1);

        let picked = group.pick(500).unwrap();
        assert!(picked.free_space() >= 500);
    }

    #[test]
    fn test_pick_never_returns_undersized_path() {
        let group = destination_group(&[("a", 100), ("b", 500), ("c", 300)], 3);

        let mut guards = Vec::new();
        for _ in 0..2 {
            let picked = group.pick(200).unwrap();
            assert!(picked.free_space() >= 200);
            guards.push(picked.try_acquire().unwrap());
        }

        // Only the 100-byte path is left; the walk must end without it.
        assert!(group.pick(200).is_none());
    }

    #[test]
    fn test_cache_pick_orders_by_transfers() {
        let plots = vec![
            path_with_free("nvme0", 100),
            path_with_free("nvme1", 100),
        ];
        let group = PlotGroup::new("cache", GroupKind::Cache, 8, plots, true);
        let plots = group.plots();

        plots[0].inc_transfers();
        group.resort_by_transfers();

        let picked = group.pick(1 << 50).unwrap();
        assert_eq!(picked.path(), PathBuf::from("/plots/nvme1"));
    }

    #[test]
    fn test_cache_pick_has_no_size_abort() {
        let plots = vec![path_with_free("nvme0", 10)];
        let group = PlotGroup::new("cache", GroupKind::Cache, 4, plots, true);

        // Far larger than the recorded free space, still picked.
        assert!(group.pick(1 << 50).is_some());
    }

    #[test]
    fn test_concurrency_capped_at_path_count() {
        let group = destination_group(&[("a", 100), ("b", 100)], 10);
        assert_eq!(group.concurrency(), 2);
    }

    #[test]
    fn test_cache_concurrency_may_exceed_path_count() {
        let plots = vec![path_with_free("nvme0", 100)];
        let group = PlotGroup::new("cache", GroupKind::Cache, 10, plots, true);
        assert_eq!(group.concurrency(), 10);
    }

    #[test]
    fn test_resort_is_stable_on_ties() {
        let group = destination_group(&[("a", 100), ("b", 100), ("c", 100)], 3);
        group.resort_by_free_space();
        group.resort_by_free_space();

        let order: Vec<_> = group.plots().iter().map(|p| p.path().to_path_buf()).collect();
        assert_eq!(
            order,
            vec![
                PathBuf::from("/plots/a"),
                PathBuf::from("/plots/b"),
                PathBuf::from("/plots/c"),
            ]
        );
    }
}
