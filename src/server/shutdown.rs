//! Graceful shutdown handling for the gateway.

use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Shutdown signal broadcaster.
///
/// Servers subscribe to the broadcast channel; in-flight pull batches hold a
/// child of the cancellation token and stop between messages.
#[derive(Clone)]
pub struct ShutdownSignal {
    sender: broadcast::Sender<()>,
    token: CancellationToken,
}

impl ShutdownSignal {
    /// Create a new shutdown signal
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self {
            sender,
            token: CancellationToken::new(),
        }
    }

    /// Subscribe to shutdown notifications
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }

    /// Token cancelled when shutdown is triggered.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Whether shutdown has been triggered.
    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Trigger shutdown
    pub fn shutdown(&self) {
        self.token.cancel();
        let _ = self.sender.send(());
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        },
    }
}

/// Wait for an OS signal, then broadcast shutdown and allow `grace` for servers to drain.
pub async fn shutdown_with_timeout(
    shutdown_signal: ShutdownSignal,
    grace: Duration,
) -> anyhow::Result<()> {
    info!("Waiting for shutdown signal...");
    wait_for_signal().await;

    info!("Broadcasting shutdown signal to all servers");
    shutdown_signal.shutdown();

    info!("Waiting up to {:?} for servers to shutdown gracefully", grace);
    tokio::time::sleep(grace).await;

    info!("Shutdown complete");
    Ok(())
}

/// Create a shutdown receiver that completes when shutdown is triggered
pub async fn shutdown_receiver(mut rx: broadcast::Receiver<()>) {
    let _ = rx.recv().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_signal() {
        let signal = ShutdownSignal::new();
        let mut rx = signal.subscribe();

        signal.shutdown();

        assert!(rx.recv().await.is_ok());
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let signal = ShutdownSignal::new();
        let mut rx1 = signal.subscribe();
        let mut rx2 = signal.subscribe();

        signal.shutdown();

        assert!(rx1.recv().await.is_ok());
        assert!(rx2.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_child_tokens() {
        let signal = ShutdownSignal::new();
        let batch = signal.token().child_token();
        assert!(!batch.is_cancelled());

        signal.shutdown();

        batch.cancelled().await;
        assert!(batch.is_cancelled());
    }
}
