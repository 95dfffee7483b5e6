//! Graceful shutdown.
//!
//! `ShutdownCoordinator` turns SIGTERM/SIGINT (Ctrl+C on Windows) into a
//! cancellation that running executions observe.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Coordinates graceful shutdown across the application.
///
/// # Example
///
/// ```rust
/// use weft::shutdown::ShutdownCoordinator;
///
/// async fn example() {
///     let coordinator = ShutdownCoordinator::new();
///     coordinator.start_signal_listener();
///     coordinator.wait_for_shutdown().await;
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown. Can be called multiple times safely.
    pub fn request_shutdown(&self) {
        if !self.token.is_cancelled() {
            info!("Shutdown requested");
            self.token.cancel();
        }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once shutdown is requested; immediately if it already was.
    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// Token cancelled together with this coordinator.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Spawn a task that requests shutdown on the first termination signal.
    pub fn start_signal_listener(&self) {
        let coordinator = self.clone();

        tokio::spawn(async move {
            #[cfg(unix)]
            {
                let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate())
                {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("Failed to create SIGTERM handler: {}", e);
                        signal::ctrl_c().await.ok();
                        coordinator.request_shutdown();
                        return;
                    }
                };

                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, initiating graceful shutdown");
                    }
                    _ = signal::ctrl_c() => {
                        info!("Received SIGINT, initiating graceful shutdown");
                    }
                    _ = coordinator.wait_for_shutdown() => return,
                }
            }

            #[cfg(not(unix))]
            {
                tokio::select! {
                    _ = signal::ctrl_c() => {
                        info!("Received Ctrl+C, initiating graceful shutdown");
                    }
                    _ = coordinator.wait_for_shutdown() => return,
                }
            }

            coordinator.request_shutdown();
        });
    }
}
