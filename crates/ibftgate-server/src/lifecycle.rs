//! Server lifecycle management and graceful shutdown

use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Server lifecycle manager
///
/// Owns the process-wide cancellation token; every connection handler gets a
/// child of it.
#[derive(Debug)]
pub struct ServerLifecycle {
    /// Current server state
    state: Arc<RwLock<ServerState>>,
    /// Process-wide shutdown token
    token: CancellationToken,
    /// Creation time
    started_at: Instant,
}

/// Server states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Server is starting up
    Starting,
    /// Accepting connections
    Running,
    /// Not accepting; waiting for handlers
    Draining,
    /// Server has stopped
    Stopped,
}

impl ServerLifecycle {
    /// Create a new lifecycle manager
    #[must_use]
    pub fn new() -> Self {
        Self::with_token(CancellationToken::new())
    }

    /// Create a lifecycle driven by an existing token
    #[must_use]
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            state: Arc::new(RwLock::new(ServerState::Starting)),
            token,
            started_at: Instant::now(),
        }
    }

    /// Get current server state
    pub async fn state(&self) -> ServerState {
        *self.state.read().await
    }

    /// Set server state
    pub async fn set_state(&self, state: ServerState) {
        *self.state.write().await = state;
    }

    /// Mark the server running
    pub async fn start(&self) {
        self.set_state(ServerState::Running).await;
        tracing::info!("Server started");
    }

    /// Request graceful shutdown
    pub fn shutdown(&self) {
        if !self.token.is_cancelled() {
            tracing::info!("Server shutdown initiated");
        }
        self.token.cancel();
    }

    /// Whether shutdown was requested
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Process-wide shutdown token
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Child token for one connection
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Time since the lifecycle was created
    #[must_use]
    pub fn uptime(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }
}

impl Default for ServerLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle for triggering graceful server shutdown
///
/// Cheap to clone; hand it to signal handlers or tests.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    lifecycle: Arc<ServerLifecycle>,
}

impl ShutdownHandle {
    /// Create a handle for `lifecycle`
    #[must_use]
    pub const fn new(lifecycle: Arc<ServerLifecycle>) -> Self {
        Self { lifecycle }
    }

    /// Trigger graceful server shutdown
    pub fn shutdown(&self) {
        self.lifecycle.shutdown();
    }

    /// Check if shutdown has been initiated
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.lifecycle.is_shutting_down()
    }

    /// Current server state
    pub async fn state(&self) -> ServerState {
        self.lifecycle.state().await
    }
}

/// Wait for Ctrl+C or, on Unix, SIGTERM
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C"),
        () = terminate => tracing::info!("Received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_state_transitions() {
        let lifecycle = ServerLifecycle::new();
        assert_eq!(lifecycle.state().await, ServerState::Starting);

        lifecycle.start().await;
        assert_eq!(lifecycle.state().await, ServerState::Running);

        lifecycle.set_state(ServerState::Draining).await;
        lifecycle.set_state(ServerState::Stopped).await;
        assert_eq!(lifecycle.state().await, ServerState::Stopped);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_children() {
        let lifecycle = Arc::new(ServerLifecycle::new());
        let child = lifecycle.child_token();
        let handle = ShutdownHandle::new(Arc::clone(&lifecycle));

        assert!(!handle.is_shutting_down());
        handle.shutdown();
        handle.shutdown();
        assert!(handle.is_shutting_down());
        assert!(child.is_cancelled());
    }
}
