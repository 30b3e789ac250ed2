//! One-shot completion signals for in-flight dependency processing.
//!
//! Every rerun cycle owns one [`ProcessingBarrier`]; every dep discovered
//! during the cycle carries a [`ProcessingHandle`] to it. The barrier is
//! resolved only after the committed snapshot has been swapped in, so a
//! waiter that sees its handle fire can re-query the store and find the
//! bundled entry (or, on the error path, find it cleared and re-register).

use tokio::sync::watch;

/// Waiter side of a barrier. Cheap to clone; any number of waiters.
#[derive(Debug, Clone)]
pub struct ProcessingHandle {
    rx: watch::Receiver<bool>,
}

impl ProcessingHandle {
    /// Wait until the owning rerun commits (or errors out). A barrier that
    /// was dropped without resolving counts as resolved so waiters never
    /// wedge.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|resolved| *resolved).await;
    }

    pub fn is_resolved(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Producer side, created once per rerun cycle. Resolving is idempotent.
#[derive(Debug)]
pub struct ProcessingBarrier {
    tx: watch::Sender<bool>,
    handle: ProcessingHandle,
}

impl ProcessingBarrier {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx,
            handle: ProcessingHandle { rx },
        }
    }

    pub fn handle(&self) -> ProcessingHandle {
        self.handle.clone()
    }

    /// Signal completion to every waiter, current and future.
    pub fn resolve(&self) {
        let _ = self.tx.send(true);
    }
}

impl Default for ProcessingBarrier {
    fn default() -> Self {
        Self::new()
    }
}
