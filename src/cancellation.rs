//! Session cancellation signal
//!
//! A cloneable token the host (CLI, IDE adapter, CI wrapper) triggers to
//! abort a run. Workers observe it at suspension points; the scheduler
//! reacts by draining non-running units to `Cancelled`.

use std::sync::Arc;
use tokio::sync::watch;

/// Externally triggerable cancellation token for a test session.
///
/// All clones observe the same underlying state. Cancelling is idempotent
/// and cannot be undone.
#[derive(Clone, Debug)]
pub struct CancellationSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancellationSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    /// Request cancellation of the session.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested. Never resolves otherwise.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // All senders gone without cancelling; stay pending.
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for CancellationSignal {
    fn default() -> Self {
        Self::new()
    }
}
