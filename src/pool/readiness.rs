//! One-way readiness latch.

use tokio::sync::watch;

/// Opens once the first pool is installed and stays open.
///
/// Waiters block until then. If startup never succeeds they never resolve; callers
/// that need a deadline wrap [`wait`](Self::wait) in a timeout.
#[derive(Debug)]
pub struct ReadinessGate {
    tx: watch::Sender<bool>,
}

impl ReadinessGate {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn open(&self) {
        self.tx.send_if_modified(|ready| {
            let changed = !*ready;
            *ready = true;
            changed
        });
    }

    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only returns once the gate opens.
        let _ = rx.wait_for(|ready| *ready).await;
    }
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}
