//! keygate broker binary.
//!
//! # Usage
//!
//! ```bash
//! # Development: loopback, in-memory store, fast sweep
//! keygated --debug
//!
//! # Production: YAML configuration, durable store
//! keygated --config /etc/keygate.yaml
//! ```

use std::path::PathBuf;

use clap::Parser;
use keygate_server::{Server, ServerError, Settings};
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// keygate session broker
#[derive(Parser, Debug)]
#[command(name = "keygated")]
#[command(about = "Session authentication broker")]
#[command(version)]
struct Args {
    /// Path to YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Development defaults: loopback, in-memory store, 60s sweep
    #[arg(short, long)]
    debug: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let settings = Settings::load(args.config.as_deref(), args.debug)?;
    tracing::info!("keygate broker starting");

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(());
    });

    run(&settings, shutdown_rx).await?;

    tracing::info!("keygate broker stopped");
    Ok(())
}

/// Picks the storage backend from settings and runs the server on it.
async fn run(settings: &Settings, shutdown: watch::Receiver<()>) -> Result<(), ServerError> {
    if settings.store.memory {
        tracing::info!("using in-memory store");
        let server = Server::bind(settings, keygate_core::MemoryStorage::new()).await?;
        server.run(shutdown).await
    } else {
        tracing::info!(path = %settings.store.path.display(), "using durable store");
        let storage = keygate_core::RedbStorage::open(&settings.store.path)?;
        let server = Server::bind(settings, storage).await?;
        server.run(shutdown).await
    }
}

/// Resolves when SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = ctrl_c => {},
                _ = term.recv() => {},
            }
        },
        Err(err) => {
            tracing::warn!("failed to install SIGTERM handler: {err}");
            let _ = ctrl_c.await;
        },
    }
}
