//! Signal handling for the daemon.
//!
//! SIGINT and SIGTERM cancel the shutdown token, which stops the scheduler
//! and cancels queued or in-progress backups between stages. SIGHUP asks
//! for a configuration reload.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Shutdown coordinator
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn trigger(&self) {
        self.token.cancel();
    }

    /// Wait for SIGTERM or SIGINT, then cancel the token
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating graceful shutdown...");
            }
            _ = self.token.cancelled() => {}
        }

        self.token.cancel();
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// SIGHUP listener; never fires where SIGHUP is unavailable
pub struct ReloadSignal {
    #[cfg(unix)]
    hangup: Option<signal::unix::Signal>,
}

impl ReloadSignal {
    #[cfg(unix)]
    pub fn new() -> Self {
        let hangup = match signal::unix::signal(signal::unix::SignalKind::hangup()) {
            Ok(hangup) => Some(hangup),
            Err(e) => {
                warn!(error = %e, "Failed to install SIGHUP handler, reload via console only");
                None
            }
        };
        Self { hangup }
    }

    #[cfg(not(unix))]
    pub fn new() -> Self {
        Self {}
    }

    #[cfg(unix)]
    pub async fn recv(&mut self) {
        if let Some(hangup) = self.hangup.as_mut() {
            if hangup.recv().await.is_some() {
                info!("Received SIGHUP, reloading configuration");
                return;
            }
            self.hangup = None;
        }
        std::future::pending::<()>().await
    }

    #[cfg(not(unix))]
    pub async fn recv(&mut self) {
        std::future::pending::<()>().await
    }
}

impl Default for ReloadSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_coordinator() {
        let coordinator = ShutdownCoordinator::new();
        let token = coordinator.token();

        // Spawn a task that will receive shutdown
        let handle = tokio::spawn(async move {
            token.cancelled().await;
        });

        // Simulate shutdown
        coordinator.trigger();

        // Task should complete
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_signal_returns_after_trigger() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.trigger();

        tokio::time::timeout(std::time::Duration::from_secs(1), coordinator.wait_for_signal())
            .await
            .unwrap();
        assert!(coordinator.token().is_cancelled());
    }
}
