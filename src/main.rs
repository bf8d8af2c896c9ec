//! mirrorsync - Encrypted master/slave file replication over QUIC
//!
//! This is the composition root that wires together all the components.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::fmt::format::FmtSpan;

use mirrorsync::{Config, Master, Role, Slave};

/// Interval between periodic node status reports.
const STATS_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "mirrorsync", version, about = "Encrypted file replication daemon")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "mirrorsync.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let cfg = Config::load(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config))?;

    let log_level = if cfg.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    tracing::info!(
        node_id = %cfg.node_id,
        role = %cfg.role,
        port = cfg.port,
        "starting mirrorsync"
    );

    match cfg.role {
        Role::Master => run_master(cfg).await,
        Role::Slave => run_slave(cfg).await,
    }
}

async fn run_master(cfg: Config) -> anyhow::Result<()> {
    let master = Arc::new(Master::new(cfg));
    master.start().await.context("starting master")?;

    let reporter = master.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STATS_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let stats = reporter.stats();
            tracing::info!(
                node_id = %stats.node_id,
                paths = stats.monitored_paths,
                watchers = stats.active_watchers,
                "master status"
            );
        }
    });

    shutdown_signal().await;
    tracing::info!("shutdown signal received");
    master.stop().await;
    Ok(())
}

async fn run_slave(cfg: Config) -> anyhow::Result<()> {
    let slave = Arc::new(Slave::new(cfg));
    slave.start().await.context("starting slave")?;

    let reporter = slave.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STATS_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let stats = reporter.stats();
            tracing::info!(
                received = stats.received,
                applied = stats.applied,
                errors = stats.errors,
                "slave status"
            );
        }
    });

    shutdown_signal().await;
    tracing::info!("shutdown signal received");
    slave.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => tracing::error!("failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
