//! Graceful shutdown coordination.
//!
//! One coordinator owns the shutdown signal for the whole process: both
//! HTTP servers, the decision-cache sweeper and the metrics collector
//! subscribe to it. Shutdown is two-phase — stop accepting new
//! connections, then wait a bounded grace period for in-flight requests
//! and the metrics drain.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Broadcasts the shutdown signal to every subscribed task.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    shutdown_initiated: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);

        Self {
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
        }
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.shutdown_initiated.load(Ordering::Relaxed)
    }

    /// Create a receiver for a task that must wind down on shutdown.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub fn initiate_shutdown(&self) {
        if !self.shutdown_initiated.swap(true, Ordering::Relaxed) {
            info!("initiating graceful shutdown");
            if let Err(e) = self.shutdown_tx.send(()) {
                warn!("failed to broadcast shutdown signal: {}", e);
            }
        }
    }

    /// Block until SIGINT or SIGTERM arrives, then broadcast shutdown.
    pub async fn wait_for_shutdown_signal(&self) {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("received Ctrl+C signal");
            }
            _ = terminate => {
                info!("received SIGTERM signal");
            }
        }

        self.initiate_shutdown();
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper for periodic background tasks that must stop on shutdown.
pub struct ShutdownAwareTask {
    shutdown_rx: broadcast::Receiver<()>,
}

impl ShutdownAwareTask {
    pub fn new(coordinator: &ShutdownCoordinator) -> Self {
        Self {
            shutdown_rx: coordinator.subscribe(),
        }
    }

    /// Wait for the duration, returning true if shutdown arrived first.
    pub async fn wait_or_shutdown(&mut self, duration: tokio::time::Duration) -> bool {
        tokio::select! {
            _ = self.shutdown_rx.recv() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }
}
