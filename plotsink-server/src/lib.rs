//! Network-attached plot sink.
//!
//! Producers stream large plot files over TCP. Each stream is first landed
//! on a fast cache path, then migrated to a bulk destination path, with
//! free-space-aware and concurrency-aware placement on both tiers.
//!
//! Why two stages? The cache tier absorbs the network-bound sequential
//! write at NVMe speed, while the slower HDD-bound migration runs under the
//! same exclusive claim on the destination path. The claim keeps any second
//! placement off that disk for the full duration, which serializes per-disk
//! writes. For bulk disks behind a shared controller that serialization is
//! the throughput-critical invariant.

pub mod sink;
pub mod transfer;
