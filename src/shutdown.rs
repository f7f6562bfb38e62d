//! Cooperative cancellation for sync runs
//!
//! Every blocking operation in the pipeline polls a shared
//! [`CancellationToken`]. Three things cancel it:
//!
//! 1. SIGINT / SIGTERM, via [`cancel_on_signal`]
//! 2. the global run deadline, via [`RunCancellation`]
//! 3. the embedding caller, through the parent token
//!
//! Cancelling never interrupts a commit in progress; targets check the token
//! before their first rename and are otherwise abandoned with no output.
//!
//! # Example
//!
//! ```rust,no_run
//! use ggen_sync::shutdown::{RunCancellation, cancel_on_signal};
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() {
//! let root = CancellationToken::new();
//! let _signals = cancel_on_signal(root.clone());
//! let run = RunCancellation::new(&root, Duration::from_secs(600));
//! // hand run.token() to the pipeline
//! assert!(!run.deadline_expired());
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Waits for SIGINT or SIGTERM.
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to install Ctrl+C handler");
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
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT (Ctrl+C), cancelling run"),
        _ = terminate => info!("received SIGTERM, cancelling run"),
    }
}

/// Cancels `token` on the first signal. The task ends when the token is
/// cancelled for any other reason.
pub fn cancel_on_signal(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = wait_for_signal() => token.cancel(),
            _ = token.cancelled() => {}
        }
    })
}

/// A run-scoped child token that also fires when the run deadline passes.
#[derive(Debug)]
pub struct RunCancellation {
    token: CancellationToken,
    expired: Arc<AtomicBool>,
    watchdog: JoinHandle<()>,
}

impl RunCancellation {
    /// Must be called inside a tokio runtime.
    pub fn new(parent: &CancellationToken, deadline: Duration) -> Self {
        let token = parent.child_token();
        let expired = Arc::new(AtomicBool::new(false));
        let watchdog = {
            let token = token.clone();
            let expired = expired.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(deadline) => {
                        warn!(deadline = ?deadline, "run deadline exceeded, cancelling");
                        expired.store(true, Ordering::SeqCst);
                        token.cancel();
                    }
                    _ = token.cancelled() => {}
                }
            })
        };
        Self {
            token,
            expired,
            watchdog,
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn deadline_expired(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }
}

impl Drop for RunCancellation {
    fn drop(&mut self) {
        self.watchdog.abort();
    }
}
