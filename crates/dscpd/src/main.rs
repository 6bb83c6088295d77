//! dscpd - DSCP Policy Daemon
//!
//! Entry point for the dscpd daemon.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use dscp_dataplane::ClassMaps;
use dscpd::{channel, Daemon};

#[derive(Debug, Parser)]
#[command(
    name = "dscpd",
    about = "DSCP policy store and packet classification daemon"
)]
struct Args {
    /// Policy file to load at startup; may be given multiple times
    #[arg(short = 'f', long = "file", value_name = "PATH")]
    files: Vec<std::path::PathBuf>,

    /// Maximum log level (error, warn, info, debug, trace)
    #[arg(short = 'l', long = "log-level", default_value = "info")]
    log_level: Level,
}

/// Initializes tracing/logging subsystem
fn init_logging(level: Level) -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("Failed to set tracing subscriber")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_level)?;

    info!("--- Starting dscpd ---");

    let maps = Arc::new(ClassMaps::new());
    let mut daemon = Daemon::new(maps);
    for path in args.files {
        daemon.store_mut().add_file(path);
    }
    daemon.store_mut().reload();

    let (handle, rx) = channel();
    let task = tokio::spawn(daemon.run(rx));

    if signal::ctrl_c().await.is_ok() {
        info!("dscpd: Received SIGINT/SIGTERM, shutting down");
    }
    drop(handle);
    let _ = task.await;

    info!("dscpd: Graceful shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_rejects_double_install() {
        assert!(init_logging(Level::INFO).is_ok());
        // The global subscriber can only be installed once; the error
        // must propagate instead of aborting.
        assert!(init_logging(Level::INFO).is_err());
    }
}
