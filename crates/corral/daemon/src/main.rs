//! Corral Daemon - Host resource manager
//!
//! The Corral daemon provides:
//! - REST API for client registration, heartbeats, claims and releases
//! - Enforcement of CPU affinity, real-time priority and memory locking
//! - Liveness supervision that reclaims units from lost clients

use clap::Parser;
use corral_daemon::{DaemonConfig, DaemonError, DaemonResult, Server};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Corral Daemon CLI
#[derive(Parser)]
#[command(name = "corrald")]
#[command(about = "Corral - Host resource manager for co-located real-time processes", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "CORRAL_CONFIG")]
    config: Option<String>,

    /// Host topology file
    #[arg(short, long, env = "CORRAL_TOPOLOGY")]
    topology: Option<PathBuf>,

    /// Listen address
    #[arg(short, long, env = "CORRAL_LISTEN_ADDR")]
    listen: Option<String>,

    /// Record host directives in memory instead of applying them
    #[arg(long, env = "CORRAL_DRY_RUN")]
    dry_run: bool,

    /// Log level
    #[arg(long, env = "CORRAL_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "CORRAL_LOG_JSON")]
    json: bool,
}

#[tokio::main]
async fn main() -> DaemonResult<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = DaemonConfig::load(cli.config.as_deref())
        .map_err(|e| DaemonError::Config(e.to_string()))?;

    // Override with CLI args
    if let Some(listen) = &cli.listen {
        config.server.listen_addr = listen
            .parse()
            .map_err(|e| DaemonError::Config(format!("Invalid listen address: {}", e)))?;
    }
    if let Some(topology) = cli.topology {
        config.topology_path = topology;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    config.enforcement.dry_run |= cli.dry_run;
    config.logging.json |= cli.json;

    // Initialize tracing
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into());

    if config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.server.listen_addr,
        topology = %config.topology_path.display(),
        dry_run = config.enforcement.dry_run,
        "Starting corral daemon"
    );

    let server = Server::new(config)?;
    match server.run().await {
        Err(DaemonError::Fatal(reason)) => {
            tracing::error!(%reason, "Corral daemon stopped on fatal condition");
            std::process::exit(DaemonError::Fatal(reason).exit_code());
        }
        other => other,
    }
}
