//! Shutdown signalling
//!
//! One `Shutdown` per process hands out cloneable `ShutdownToken`s. Every
//! background loop selects on `token.cancelled()` and exits at its next await.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Shutdown signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Normal graceful shutdown (SIGTERM, SIGINT)
    Graceful,
    /// Urgent shutdown - skip optional cleanup
    Urgent,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Graceful => write!(f, "graceful"),
            ShutdownSignal::Urgent => write!(f, "urgent"),
        }
    }
}

/// Shutdown coordinator
#[derive(Debug)]
pub struct Shutdown {
    signal_tx: watch::Sender<Option<ShutdownSignal>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (signal_tx, _) = watch::channel(None);
        Self { signal_tx }
    }

    /// Request shutdown. Only the first request is recorded.
    pub fn request_shutdown(&self, signal: ShutdownSignal) {
        let first = self.signal_tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(signal);
            true
        });

        if first {
            info!(%signal, "shutdown requested");
        } else {
            warn!(%signal, "shutdown already requested, ignoring duplicate signal");
        }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.signal_tx.borrow().is_some()
    }

    pub fn signal(&self) -> Option<ShutdownSignal> {
        *self.signal_tx.borrow()
    }

    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            signal_rx: self.signal_tx.subscribe(),
            _sender: None,
        }
    }
}

/// Token for observing shutdown in async tasks
#[derive(Debug, Clone)]
pub struct ShutdownToken {
    signal_rx: watch::Receiver<Option<ShutdownSignal>>,
    // Set only for `never()` tokens, which own their sender
    _sender: Option<Arc<watch::Sender<Option<ShutdownSignal>>>>,
}

impl ShutdownToken {
    /// A token that is never cancelled, for one-shot callers.
    pub fn never() -> Self {
        let (tx, signal_rx) = watch::channel(None);
        Self {
            signal_rx,
            _sender: Some(Arc::new(tx)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal_rx.borrow().is_some()
    }

    /// Resolves once shutdown was requested. A dropped coordinator counts as
    /// shutdown.
    pub async fn cancelled(&self) {
        let mut rx = self.signal_rx.clone();
        let _ = rx.wait_for(|signal| signal.is_some()).await;
    }
}

/// Turn SIGINT/SIGTERM (Ctrl+C on Windows) into a graceful shutdown request.
/// SIGQUIT requests an urgent one.
pub fn install_signal_handlers(shutdown: Arc<Shutdown>) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let handlers = [
            (SignalKind::terminate(), "SIGTERM", ShutdownSignal::Graceful),
            (SignalKind::interrupt(), "SIGINT", ShutdownSignal::Graceful),
            (SignalKind::quit(), "SIGQUIT", ShutdownSignal::Urgent),
        ];

        for (kind, name, request) in handlers {
            let mut stream = signal(kind)?;
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if stream.recv().await.is_some() {
                    info!(signal = name, "received signal");
                    shutdown.request_shutdown(request);
                }
            });
        }
    }

    #[cfg(windows)]
    {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received Ctrl+C");
                shutdown.request_shutdown(ShutdownSignal::Graceful);
            }
        });
    }

    Ok(())
}
