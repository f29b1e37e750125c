//! Listening-socket binding with sequential port probing, and the
//! process-wide shutdown coordinator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to bind {host}:{port}: {source}")]
    TransportBindFailure {
        host: String,
        port: u16,
        source: std::io::Error,
    },
    #[error("no free port starting at {start_port} after {attempts} attempts")]
    PortExhausted { start_port: u16, attempts: u32 },
}

/// Binds a listener, probing sequential ports on conflict.
///
/// Each attempt opens and drops a throwaway listener before the real bind;
/// losing the race between the two is treated the same as an occupied port.
/// Callers must read the bound port back from the listener since it may
/// differ from `start_port`.
pub async fn bind_with_retry(
    host: &str,
    start_port: u16,
    max_retries: u32,
    retry_delay: Duration,
) -> Result<TcpListener, LaunchError> {
    let max_attempts = max_retries.saturating_add(1);
    let mut port = start_port;
    let mut attempts = 0;

    for attempt in 1..=max_attempts {
        if attempt > 1 {
            tokio::time::sleep(retry_delay).await;
        }
        attempts = attempt;

        match probe_and_bind(host, port).await {
            Ok(listener) => {
                info!(host, port, attempt, "listener bound");
                return Ok(listener);
            }
            Err(err) => {
                warn!(error = %err, "port unavailable, advancing to next");
            }
        }

        // Running off the end of the port range ends the probe early.
        port = match port.checked_add(1) {
            Some(next) => next,
            None => break,
        };
    }

    Err(LaunchError::PortExhausted {
        start_port,
        attempts,
    })
}

async fn probe_and_bind(host: &str, port: u16) -> Result<TcpListener, LaunchError> {
    let bind_failure = |source| LaunchError::TransportBindFailure {
        host: host.to_string(),
        port,
        source,
    };

    // Throwaway probe filters out occupied ports cheaply; the real bind can
    // still lose a race with another process.
    let probe = TcpListener::bind((host, port)).await.map_err(bind_failure)?;
    drop(probe);
    TcpListener::bind((host, port)).await.map_err(bind_failure)
}

/// Tracks whether shutdown has begun; only the first trigger proceeds.
pub struct ShutdownCoordinator {
    begun: AtomicBool,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            begun: AtomicBool::new(false),
        }
    }

    /// Returns true for the first caller only.
    pub fn begin(&self) -> bool {
        !self.begun.swap(true, Ordering::SeqCst)
    }

    pub fn has_begun(&self) -> bool {
        self.begun.load(Ordering::SeqCst)
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves when a termination signal arrives, marking the coordinator so
/// repeated signals do not restart the drain.
pub async fn shutdown_signal(coordinator: Arc<ShutdownCoordinator>) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    if coordinator.begin() {
        info!("termination signal received, draining connections");
    }
}
