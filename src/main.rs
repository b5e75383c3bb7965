//! nprobe - distributed latency monitoring.
//!
//! One binary runs either as the head, which owns the configuration and
//! ingests reports, or as a satellite, which probes its assigned targets and
//! reports to the head.

mod config;
mod head;
mod models;
mod probe;
mod protocol;
mod satellite;
mod sink;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use config::{HeadConfig, SatelliteConfig};
use head::{AppState, ConfigStore, Server};
use satellite::{Shutdown, ShutdownReason};
use sink::SqliteSink;

/// Distributed latency monitoring agent.
#[derive(Parser)]
#[command(name = "nprobe", version, about)]
struct Cli {
    /// Logging verbosity (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve configuration to satellites and ingest their reports.
    Head(HeadConfig),
    /// Probe assigned targets and report to the head.
    Satellite(SatelliteConfig),
    /// Print version information and exit.
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Command::Version = cli.command {
        println!("nprobe {}", protocol::AGENT_VERSION);
        return Ok(());
    }

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Command::Head(cfg) => run_head(cfg).await,
        Command::Satellite(cfg) => run_satellite(cfg).await,
        Command::Version => Ok(()),
    }
}

async fn run_head(cfg: HeadConfig) -> Result<()> {
    tracing::info!("Starting nprobe head {} on port {}", protocol::AGENT_VERSION, cfg.http_port);

    let store = Arc::new(
        ConfigStore::load(&cfg.config)
            .with_context(|| format!("loading configuration from {}", cfg.config.display()))?,
    );

    let sink_path = store.get().sink.path.clone();
    let sink = Arc::new(
        SqliteSink::new(&sink_path)
            .with_context(|| format!("opening metric sink at {}", sink_path.display()))?,
    );
    tracing::info!("Writing reports to {}", sink_path.display());
    let (sink_tx, writer) = sink::spawn_writer(sink, cfg.sink_queue);

    let token = CancellationToken::new();
    {
        let token = token.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            token.cancel();
        });
    }

    let server = Server::new(cfg.http_port, AppState { store, sink_tx });
    server.start(token).await.context("running head server")?;

    // Close the queue so the writer flushes what is left.
    drop(server);
    writer.await.context("waiting for metric writer")?;
    tracing::info!("Head stopped");
    Ok(())
}

async fn run_satellite(cfg: SatelliteConfig) -> Result<()> {
    let secret = std::env::var("NPROBE_SECRET").context("NPROBE_SECRET must be set")?;
    tracing::info!(
        "Starting nprobe satellite {} as {} against {}",
        protocol::AGENT_VERSION,
        cfg.name,
        cfg.head
    );

    let shutdown = Shutdown::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.trigger(ShutdownReason::Interrupted);
        });
    }

    let reason = satellite::run(&cfg, &secret, shutdown)
        .await
        .context("satellite failed")?;

    // A stale configuration is a clean exit; the service manager restarts us.
    tracing::info!("Satellite stopped: {}", reason);
    Ok(())
}

/// Resolves on SIGINT, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to register SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
