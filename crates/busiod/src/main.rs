//! busiod - bus I/O daemon
//!
//! Usage:
//!   busiod [OPTIONS] [config.toml]
//!
//! Without a config file the daemon starts with defaults and no interfaces;
//! configure them with `PUT /io/config`.

use anyhow::Result;
use busiod::{Daemon, DaemonConfig};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "busiod")]
#[command(about = "Bus capture/spoof daemon")]
struct Args {
    /// Configuration file path (TOML format)
    config: Option<String>,

    /// HTTP listen port (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Shut down after this long without a heartbeat; 0 disables
    #[arg(long, env = "BUSIOD_HEARTBEAT_TIMEOUT_MS")]
    heartbeat_timeout_ms: Option<u64>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose {
        "busiod=debug,busio_io=debug,busio_iface=debug,busio_core=debug,tower_http=debug"
    } else {
        "busiod=info,busio_io=info,busio_iface=info,busio_core=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting busiod");

    let mut config = match &args.config {
        Some(path) => {
            tracing::info!("Loading config from: {}", path);
            DaemonConfig::load(path)?
        }
        None => {
            tracing::info!("No config file provided, starting without interfaces");
            DaemonConfig::default()
        }
    };
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(timeout) = args.heartbeat_timeout_ms {
        config.node.heartbeat_timeout_ms = timeout;
    }

    let daemon = Daemon::start(config).await?;

    let node = daemon.node().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, shutting down");
            node.close();
        }
    });

    daemon.wait().await
}
