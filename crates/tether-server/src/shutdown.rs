//! Process-wide shutdown: one cancellation token plus a tracker for every
//! live WebSocket session task.
//!
//! Cancelling the token stops the accept loop, the reaper and every session
//! read loop. `graceful_shutdown` then waits for the background handles and
//! the tracked sessions to finish, bounded by a timeout.

use std::future::Future;
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tokio_util::task::task_tracker::TrackedFuture;
use tracing::{info, warn};

const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared by the server, the reaper and every socket.
#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    sessions: TaskTracker,
}

impl ShutdownCoordinator {
    /// Create a coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clone of the shutdown token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Signal shutdown. Idempotent.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether shutdown has been signalled.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Count `session` as live until it completes or is dropped.
    pub fn track_session<F: Future>(&self, session: F) -> TrackedFuture<F> {
        self.sessions.track_future(session)
    }

    /// Sessions currently tracked.
    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Signal shutdown, then wait for `handles` and every tracked session.
    ///
    /// Returns `false` if `timeout` (default 30s) elapsed first.
    pub async fn graceful_shutdown(
        &self,
        handles: Vec<JoinHandle<()>>,
        timeout: Option<Duration>,
    ) -> bool {
        let timeout = timeout.unwrap_or(DEFAULT_DRAIN_TIMEOUT);
        self.shutdown();
        let _ = self.sessions.close();
        info!(
            tasks = handles.len(),
            sessions = self.sessions.len(),
            timeout_secs = timeout.as_secs(),
            "draining"
        );

        let drain = async {
            let _ = join_all(handles).await;
            self.sessions.wait().await;
        };
        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!(sessions = self.sessions.len(), "drain timed out after {timeout:?}");
            return false;
        }
        true
    }
}
