//! keygate production server.
//!
//! Tokio runtime glue around [`keygate_core`]: a stream-socket listener
//! (TCP or Unix), one task per connection, and a background expiration
//! sweep. All operations serialize on a single async mutex around the
//! [`SessionRegistry`], which makes each request's read-modify-write cycle
//! atomic with respect to every other request and the sweep.
//!
//! # Components
//!
//! - [`Server`]: bind + accept loop + sweep task
//! - [`Settings`]: layered configuration (defaults, YAML file, environment)
//! - [`transport::Listener`]: TCP / Unix socket abstraction

mod config;
mod conn;
mod error;
pub mod transport;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

pub use config::{ListenSettings, Settings, StoreSettings, SweepSettings};
pub use error::ServerError;
use keygate_core::{SessionRegistry, Storage, StorageError};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use crate::transport::Listener;

/// The registry handle shared by all connection tasks and the sweep.
pub type SharedRegistry<S> = Arc<tokio::sync::Mutex<SessionRegistry<S>>>;

/// Production keygate server.
pub struct Server<S: Storage> {
    listener: Listener,
    registry: SharedRegistry<S>,
    sweep_interval: Duration,
}

impl<S: Storage> Server<S> {
    /// Validates the storage backend and binds the listener.
    pub async fn bind(settings: &Settings, storage: S) -> Result<Self, ServerError> {
        storage.ready().await?;
        let listener = Listener::bind(&settings.listen).await?;

        Ok(Self {
            listener,
            registry: Arc::new(tokio::sync::Mutex::new(SessionRegistry::new(storage))),
            sweep_interval: settings.sweep.interval(),
        })
    }

    /// The bound TCP address, if listening on TCP.
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.listener.tcp_addr()
    }

    /// Runs until `shutdown` fires or a storage failure occurs.
    ///
    /// Every accepted connection gets its own task; the sweep runs on its
    /// own interval task. A storage failure anywhere stops the server with
    /// an error so the supervisor can restart it.
    pub async fn run(self, mut shutdown: watch::Receiver<()>) -> Result<(), ServerError> {
        let Self { listener, registry, sweep_interval } = self;

        // Capacity 1 is enough: the first fatal error wins, later ones are
        // dropped along with the process.
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<StorageError>(1);

        let sweep_task = tokio::spawn(run_sweep(
            Arc::clone(&registry),
            sweep_interval,
            shutdown.clone(),
            fatal_tx.clone(),
        ));

        let result = loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    tracing::info!("shutdown signal received");
                    break Ok(());
                },
                Some(err) = fatal_rx.recv() => break Err(ServerError::Storage(err)),
                accepted = listener.accept() => match accepted {
                    Ok((conn, peer)) => {
                        tracing::debug!(%peer, "connection accepted");
                        let registry = Arc::clone(&registry);
                        let fatal_tx = fatal_tx.clone();
                        tokio::spawn(async move {
                            if let Err(ServerError::Storage(err)) =
                                conn::serve(conn, &peer, &registry).await
                            {
                                tracing::error!(%peer, "storage failure: {err}");
                                let _ = fatal_tx.try_send(err);
                            }
                        });
                    },
                    Err(err) => tracing::error!("accept error: {err}"),
                },
            }
        };

        sweep_task.abort();
        result
    }
}

/// Sweep loop: one registry sweep per interval tick until shutdown.
async fn run_sweep<S: Storage>(
    registry: SharedRegistry<S>,
    interval: Duration,
    mut shutdown: watch::Receiver<()>,
    fatal_tx: mpsc::Sender<StorageError>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so a restart loop does not
    // hammer storage.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let result = {
                    let mut registry = registry.lock().await;
                    registry.sweep().await
                };
                if let Err(err) = result {
                    tracing::error!("sweep failed: {err}");
                    let _ = fatal_tx.try_send(err);
                    break;
                }
            },
        }
    }
}
