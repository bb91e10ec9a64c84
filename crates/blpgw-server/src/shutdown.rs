//! Shutdown signalling for the listener, the API session reaper, open
//! WebSocket sessions and in-flight long polls.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How long [`ShutdownCoordinator::drain`] waits by default.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// One cancellation token shared by every long-lived task of a server.
#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a coordinator that has not fired yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// A clone of the token. Tasks select on `cancelled()`.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Fire the token. Idempotent.
    pub fn shutdown(&self) {
        if !self.token.is_cancelled() {
            info!("shutdown requested");
        }
        self.token.cancel();
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Fire the token and wait up to `timeout` for `handle`.
    ///
    /// Returns `false` if the task was still running at the deadline; it is
    /// aborted in that case.
    pub async fn drain(&self, mut handle: JoinHandle<()>, timeout: Duration) -> bool {
        self.shutdown();
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                warn!(error = %err, "server task failed during shutdown");
                true
            }
            Err(_) => {
                warn!(?timeout, "server task still running at shutdown deadline, aborting");
                handle.abort();
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_every_token_once() {
        let coord = ShutdownCoordinator::new();
        let before = coord.token();
        assert!(!coord.is_shutting_down());

        coord.shutdown();
        coord.shutdown();
        assert!(coord.is_shutting_down());
        assert!(before.is_cancelled());
        assert!(coord.token().is_cancelled());
    }

    #[tokio::test]
    async fn drain_waits_for_cooperative_task() {
        let coord = ShutdownCoordinator::new();
        let token = coord.token();
        let handle = tokio::spawn(async move { token.cancelled().await });

        assert!(coord.drain(handle, DEFAULT_DRAIN_TIMEOUT).await);
        assert!(coord.is_shutting_down());
    }

    #[tokio::test(start_paused = true)]
    async fn drain_aborts_stuck_task() {
        let coord = ShutdownCoordinator::new();
        let handle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(300)).await;
        });

        assert!(!coord.drain(handle, Duration::from_millis(100)).await);
    }
}
