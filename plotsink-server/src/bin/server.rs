use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use tokio_graceful_shutdown::{SubsystemBuilder, Toplevel};

use plotsink_core::config::Config;
use plotsink_core::tool::setup_log;
use plotsink_server::sink::Sink;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on.
    #[arg(short, long, default_value_t = 1337)]
    port: u16,

    /// Configuration file.
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,
}

/// In-flight transfers drain before exit. A 100 GiB plot landing on bulk
/// storage can take tens of minutes, so the drain window must dwarf any
/// plausible transfer.
const SHUTDOWN_DRAIN_LIMIT: Duration = Duration::from_secs(24 * 60 * 60);

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    setup_log();

    let config = Config::load(&args.config)?;
    let sink = Sink::new(&config, args.port).await?;

    // Run the server until SIGINT/SIGTERM
    let result = Toplevel::new(move |s| async move {
        s.start(SubsystemBuilder::new("sink", move |s| sink.run(s)));
    })
    .catch_signals()
    .handle_shutdown_requests(SHUTDOWN_DRAIN_LIMIT)
    .await;

    if let Err(e) = result {
        bail!("sink shut down with errors: {}", e);
    }
    Ok(())
}
