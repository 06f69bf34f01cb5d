use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{bail, Result};
use dashmap::DashMap;
use log::{error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_graceful_shutdown::SubsystemHandle;

use plotsink_core::config::Config;
use plotsink_core::error_bail;
use plotsink_core::plot_group::{GroupKind, PlotGroup};
use plotsink_core::plot_path::PlotPath;

use crate::transfer;

/// The sink server process: one cache group, the destination groups, and
/// the listener producers connect to.
pub struct Sink {
    cache_group: Arc<PlotGroup>,

    /// Destination groups, kept sorted by in-flight transfers ascending so
    /// placement spreads across controllers. Picks take the read lock,
    /// re-sorts take the write lock.
    sorted_groups: RwLock<Vec<Arc<PlotGroup>>>,

    /// Taken by `serve`; dropping it on shutdown refuses new connections
    /// while in-flight transfers drain.
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,

    /// Gauge of connections currently inside a handler.
    outstanding: AtomicI64,

    shutdown: Notify,

    /// Filenames currently being received. A duplicate stream is refused
    /// here, before it can fail the exclusive create on the cache tier and
    /// mis-pause a healthy destination.
    active_plots: DashMap<String, ()>,
}

impl Sink {
    /// Validate the configured groups and bind the listener. Returns an
    /// error if no usable cache path or destination group remains, both
    /// fatal at startup.
    pub async fn new(config: &Config, port: u16) -> Result<Arc<Sink>> {
        let skip = config.skip_directory_file.as_deref();

        let cache_group = Arc::new(PlotGroup::from_config(
            "cache",
            &config.cache,
            GroupKind::Cache,
            skip,
            true,
        ));
        if cache_group.is_empty() {
            error_bail!("at least one valid cache path must be specified");
        }

        let mut groups = Vec::new();
        for (name, group_cfg) in &config.destinations {
            let group = Arc::new(PlotGroup::from_config(
                name,
                group_cfg,
                GroupKind::Destination,
                skip,
                false,
            ));
            if group.is_empty() {
                warn!("Destination group {:?} has no usable paths, dropping it", name);
                continue;
            }
            groups.push(group);
        }
        if groups.is_empty() {
            error_bail!("at least one valid destination group must be specified");
        }

        if config.cache.concurrency > config.destination_concurrency_total() {
            warn!(
                "Cache concurrency {} exceeds the destination total {}; receives will outpace migration",
                config.cache.concurrency,
                config.destination_concurrency_total()
            );
        }

        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let local_addr = listener.local_addr()?;
        info!("Listening on {}...", local_addr);

        Ok(Arc::new(Self {
            cache_group,
            sorted_groups: RwLock::new(groups),
            listener: Mutex::new(Some(listener)),
            local_addr,
            outstanding: AtomicI64::new(0),
            shutdown: Notify::new(),
            active_plots: DashMap::new(),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn cache_group(&self) -> &Arc<PlotGroup> {
        &self.cache_group
    }

    /// Snapshot of the destination groups in their current order.
    pub fn destination_groups(&self) -> Vec<Arc<PlotGroup>> {
        self.sorted_groups.read().unwrap().clone()
    }

    /// Connections currently inside a handler.
    pub fn outstanding(&self) -> i64 {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// Stop accepting connections. `serve` drains in-flight transfers and
    /// returns.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Loop over the destination groups, sorted by the number of transfers
    /// they already have, and return the first group that can place the
    /// stream along with the chosen path.
    pub fn pick_destination(&self, size: u64) -> Option<(Arc<PlotGroup>, Arc<PlotPath>)> {
        let groups = self.sorted_groups.read().unwrap();
        for group in groups.iter() {
            if let Some(plot) = group.pick(size) {
                return Some((Arc::clone(group), plot));
            }
        }
        None
    }

    /// Re-sort the destination groups by in-flight transfers. This should
    /// be done after every transfer ends, so placement always sees current
    /// load.
    pub fn sort_groups(&self) {
        let mut groups = self.sorted_groups.write().unwrap();
        groups.sort_by_key(|group| group.transfers());
    }

    pub(crate) fn claim_filename(&self, name: &str) -> bool {
        self.active_plots.insert(name.to_string(), ()).is_none()
    }

    pub(crate) fn release_filename(&self, name: &str) {
        self.active_plots.remove(name);
    }

    /// Accept connections until shutdown, then drain. Each connection runs
    /// its whole transfer pipeline as blocking I/O on the runtime's
    /// blocking pool, so the accept loop never stalls behind a copy.
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        let listener = self.listener.lock().unwrap().take();
        let Some(listener) = listener else {
            bail!("listener already taken, serve may only run once");
        };

        let mut handlers: JoinSet<()> = JoinSet::new();
        info!("Ready");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let sink = Arc::clone(&self);
                            handlers.spawn(async move {
                                sink.handle_connection(stream, peer).await;
                            });
                        }
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                        }
                    }
                }
                Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
                _ = self.shutdown.notified() => break,
            }
        }

        // Refuse new connections while the in-flight transfers drain. The
        // wait is unbounded, transfers may be tens of minutes long.
        drop(listener);
        let draining = handlers.len();
        if draining > 0 {
            info!("Draining {} in-flight transfers", draining);
        }
        while handlers.join_next().await.is_some() {}

        info!("Sink stopped");
        Ok(())
    }

    /// `serve` wired to the shutdown subsystem for the server binary.
    pub async fn run(self: Arc<Self>, subsys: SubsystemHandle) -> Result<()> {
        let sink = Arc::clone(&self);
        let mut server = tokio::spawn(sink.serve());

        tokio::select! {
            res = &mut server => {
                return res?;
            }
            _ = subsys.on_shutdown_requested() => {}
        }

        self.shutdown();
        server.await?
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        self.outstanding.fetch_add(1, Ordering::Relaxed);

        let result = match into_blocking(stream) {
            Ok(stream) => {
                let sink = Arc::clone(&self);
                tokio::task::spawn_blocking(move || transfer::handle(&sink, stream, peer)).await
            }
            Err(e) => {
                warn!("Failed to detach connection from {}: {}", peer, e);
                Ok(())
            }
        };

        if let Err(e) = result {
            error!("Transfer task for {} failed: {}", peer, e);
        }

        self.outstanding.fetch_sub(1, Ordering::Relaxed);
    }
}

/// The transfer pipeline is plain blocking I/O; hand the socket over to it.
fn into_blocking(stream: TcpStream) -> io::Result<std::net::TcpStream> {
    let stream = stream.into_std()?;
    stream.set_nonblocking(false)?;
    Ok(stream)
}
