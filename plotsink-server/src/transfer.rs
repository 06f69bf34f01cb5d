use std::fs::{self, File};
use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use likely_stable::unlikely;
use log::{error, info, warn};

use plotsink_core::direct_io::DirectWriter;
use plotsink_core::plot_group::PlotGroup;
use plotsink_core::plot_path::PlotPath;
use plotsink_core::wire;

use crate::sink::Sink;

/// One in-flight transfer charged against a destination group. Dropping
/// the slot releases the charge and refreshes the group order, so sorts
/// always reflect current state.
struct GroupSlot<'a> {
    sink: &'a Sink,
    group: Arc<PlotGroup>,
}

impl<'a> GroupSlot<'a> {
    fn charge(sink: &'a Sink, group: Arc<PlotGroup>) -> Self {
        group.inc_transfers();
        Self { sink, group }
    }
}

impl Drop for GroupSlot<'_> {
    fn drop(&mut self) {
        self.group.dec_transfers();
        self.sink.sort_groups();
    }
}

/// One in-flight receive charged against the cache tier: the group budget
/// plus the chosen path's spread counter.
struct CacheSlot {
    group: Arc<PlotGroup>,
    plot: Arc<PlotPath>,
}

impl CacheSlot {
    fn charge(group: Arc<PlotGroup>, plot: Arc<PlotPath>) -> Self {
        group.inc_transfers();
        plot.inc_transfers();
        Self { group, plot }
    }
}

impl Drop for CacheSlot {
    fn drop(&mut self) {
        self.plot.dec_transfers();
        self.group.dec_transfers();
        self.group.resort();
    }
}

/// Removes the filename from the in-flight registry once the transfer is
/// over, whichever way it ends.
struct ActiveName<'a> {
    sink: &'a Sink,
    name: String,
}

impl Drop for ActiveName<'_> {
    fn drop(&mut self) {
        self.sink.release_filename(&self.name);
    }
}

/// Facilitate one plot transfer end to end. Encapsulates a single
/// connection; errors are logged and answered by closing the socket, the
/// producer retries elsewhere.
pub(crate) fn handle(sink: &Sink, mut stream: TcpStream, peer: SocketAddr) {
    let size = match wire::read_size(&mut stream) {
        Ok(size) => size,
        Err(e) => {
            warn!("Failed to receive file size from {}: {}", peer, e);
            return;
        }
    };

    if unlikely(size == 0) {
        warn!("Request from {} declared a zero-byte plot, refusing", peer);
        return;
    }

    // Pick a destination early and lock it for the whole pipeline. A lost
    // acquisition race closes the connection; waiting here would stall a
    // producer that could retry another sink.
    let Some((group, plot)) = sink.pick_destination(size) else {
        info!(
            "Request to store {} bytes from {}, but no destination has space and capacity",
            size, peer
        );
        return;
    };
    let Some(_guard) = plot.try_acquire() else {
        return;
    };

    let _group_slot = GroupSlot::charge(sink, Arc::clone(&group));

    let Some(cache_plot) = sink.cache_group().pick(size) else {
        info!(
            "Request to store {} bytes from {}, but the cache tier is saturated",
            size, peer
        );
        return;
    };
    let _cache_slot = CacheSlot::charge(Arc::clone(sink.cache_group()), Arc::clone(&cache_plot));

    // Placement succeeded, tell the producer to start streaming.
    if let Err(e) = stream.write_all(&[wire::ACK]) {
        warn!("Failed to send go-ahead to {}: {}", peer, e);
        return;
    }

    let fnlen = match wire::read_filename_len(&mut stream) {
        Ok(len) => len,
        Err(e) => {
            warn!("Failed to receive filename length from {}: {}", peer, e);
            return;
        }
    };
    if unlikely(fnlen <= 0 || fnlen as usize > wire::MAX_FILENAME_LEN) {
        warn!("Refusing filename length {} from {}", fnlen, peer);
        return;
    }

    let filename = match wire::read_filename(&mut stream, fnlen as usize) {
        Ok(name) => name,
        Err(e) => {
            warn!("Failed to receive filename from {}: {}", peer, e);
            return;
        }
    };

    if !sink.claim_filename(&filename) {
        warn!(
            "Plot {} is already being received, refusing duplicate from {}",
            filename, peer
        );
        return;
    }
    let _active = ActiveName {
        sink,
        name: filename.clone(),
    };

    // Stage one: absorb the stream onto fast cache storage.
    let Some(cache_file) = receive_to_cache(&mut stream, &cache_plot, &plot, &filename) else {
        return;
    };
    cache_plot.update_free_space();

    // Stage two: migrate from cache to the destination disk, still holding
    // the destination exclusively.
    if migrate(&cache_file, &plot, &filename) {
        if let Err(e) = fs::remove_file(&cache_file) {
            warn!(
                "Failed to remove cache copy {}: {}",
                cache_file.display(),
                e
            );
        }
        cache_plot.update_free_space();
    }

    plot.update_free_space();
    group.resort_by_free_space();
}

/// Receive the stream into `<cache>/<name>.tmp` and commit it to
/// `<cache>/<name>`. Returns the committed path. A write failure pauses
/// the destination, the producer's stream has nowhere to land for now.
fn receive_to_cache(
    stream: &mut TcpStream,
    cache_plot: &PlotPath,
    dest_plot: &PlotPath,
    filename: &str,
) -> Option<PathBuf> {
    let tmpfile = cache_plot.path().join(format!("{}.tmp", filename));

    let mut writer = match DirectWriter::create(&tmpfile) {
        Ok(writer) => writer,
        Err(e) => {
            error!("Failed to open file at {}: {}", tmpfile.display(), e);
            dest_plot.pause();
            return None;
        }
    };

    info!("Receiving plot at {}", tmpfile.display());
    let start = Instant::now();

    let bytes = match writer.copy_from(stream) {
        Ok(_) => match writer.finish() {
            Ok(bytes) => bytes,
            Err(e) => {
                write_failure(&tmpfile, dest_plot, "writing", &e);
                return None;
            }
        },
        Err(e) => {
            write_failure(&tmpfile, dest_plot, "writing", &e);
            return None;
        }
    };

    let cache_file = cache_plot.path().join(filename);
    if let Err(e) = fs::rename(&tmpfile, &cache_file) {
        write_failure(&tmpfile, dest_plot, "committing", &e);
        return None;
    }

    let seconds = start.elapsed().as_secs_f64();
    info!(
        "Successfully stored {} ({} bytes, {:.1} secs, {:.1} MB/s)",
        cache_file.display(),
        bytes,
        seconds,
        rate_mb(bytes, seconds)
    );

    Some(cache_file)
}

/// Copy the cached plot to its destination and commit it under its final
/// name. A failure pauses the destination and keeps the cache copy.
fn migrate(cache_file: &Path, dest_plot: &PlotPath, filename: &str) -> bool {
    let mut src = match File::open(cache_file) {
        Ok(file) => file,
        Err(e) => {
            error!("Failed to open cache copy {}: {}", cache_file.display(), e);
            return false;
        }
    };

    let dstfile = dest_plot.path().join(filename);
    let tmpdst = dest_plot.path().join(format!("{}.tmp", filename));

    let mut writer = match DirectWriter::create(&tmpdst) {
        Ok(writer) => writer,
        Err(e) => {
            error!("Failed to open dest file {}: {}", tmpdst.display(), e);
            dest_plot.pause();
            return false;
        }
    };

    let start = Instant::now();

    let bytes = match writer.copy_from(&mut src) {
        Ok(_) => match writer.finish() {
            Ok(bytes) => bytes,
            Err(e) => {
                write_failure(&tmpdst, dest_plot, "moving", &e);
                return false;
            }
        },
        Err(e) => {
            write_failure(&tmpdst, dest_plot, "moving", &e);
            return false;
        }
    };

    // Downstream consumers only pick up non-tmp names; the rename is the
    // publish.
    if let Err(e) = fs::rename(&tmpdst, &dstfile) {
        write_failure(&tmpdst, dest_plot, "renaming", &e);
        return false;
    }

    let seconds = start.elapsed().as_secs_f64();
    info!(
        "Moved plot {} ({} bytes, {:.1} secs, {:.1} MB/s)",
        dstfile.display(),
        bytes,
        seconds,
        rate_mb(bytes, seconds)
    );

    true
}

fn write_failure(tmpfile: &Path, dest_plot: &PlotPath, what: &str, e: &std::io::Error) {
    error!("Failure while {} {}: {}", what, tmpfile.display(), e);
    if let Err(e) = fs::remove_file(tmpfile) {
        warn!("Failed to remove {}: {}", tmpfile.display(), e);
    }
    dest_plot.pause();
}

fn rate_mb(bytes: u64, seconds: f64) -> f64 {
    if seconds <= 0.0 {
        return 0.0;
    }
    bytes as f64 / 1_000_000.0 / seconds
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_mb() {
        assert_eq!(rate_mb(2_000_000, 2.0), 1.0);
        assert_eq!(rate_mb(1_000_000, 0.0), 0.0);
    }
}
