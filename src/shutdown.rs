//! Shutdown coordination.
//!
//! A [`ShutdownSignal`] is cloned into every component that must react to
//! shutdown: the HTTP server, the publisher supervisor and the binary's
//! main task. It fires on SIGINT/SIGTERM or when [`ShutdownSignal::trigger`]
//! is called (the publisher supervisor does this after too many worker
//! failures).
//!
//! ```rust,ignore
//! let shutdown = ShutdownSignal::new();
//! let server_shutdown = shutdown.clone();
//!
//! axum::serve(listener, app)
//!     .with_graceful_shutdown(async move { server_shutdown.recv().await })
//!     .await?;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Default bound on how long an orchestrated shutdown may take.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct ShutdownSignal {
    sender: broadcast::Sender<()>,
    triggered: Arc<AtomicBool>,
    timeout: Duration,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_SHUTDOWN_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let (sender, _) = broadcast::channel(1);
        Self {
            sender,
            triggered: Arc::new(AtomicBool::new(false)),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether shutdown has been requested by any clone.
    pub fn is_shutdown(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Request shutdown. Only the first call notifies.
    pub fn trigger(&self) {
        if !self.triggered.swap(true, Ordering::SeqCst) {
            info!("Shutdown triggered");
            let _ = self.sender.send(());
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }

    /// Resolve once shutdown has been requested. Returns immediately if it
    /// already was.
    pub async fn recv(&self) {
        let mut receiver = self.sender.subscribe();
        if self.is_shutdown() {
            return;
        }
        let _ = receiver.recv().await;
    }

    /// Wait for SIGINT, SIGTERM or a programmatic trigger, then make sure
    /// every clone observes shutdown.
    pub async fn wait(&self) {
        tokio::select! {
            _ = ctrl_c() => info!("Received Ctrl+C, initiating graceful shutdown"),
            _ = terminate() => info!("Received SIGTERM, initiating graceful shutdown"),
            _ = self.recv() => {}
        }
        self.trigger();
    }

    /// Like [`recv`](Self::recv) but bounded. Returns false on timeout.
    pub async fn wait_with_timeout(&self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Timed out waiting for shutdown");
                false
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(e) => {
            error!(error = %e, "Failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
