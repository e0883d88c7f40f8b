use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

/// Process-wide, write-once shutdown broadcast.
///
/// Clones observe the same state. Works across runtimes, so monitors running on their own
/// threads can wait on it too.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fires the signal. Returns `true` only for the call that actually fired it.
    pub fn trigger(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the signal has fired, immediately if it already has.
    pub async fn triggered(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|&fired| fired).await;
    }

    /// Fires the signal when the returned guard goes out of scope.
    pub fn drop_guard(&self) -> DropGuard {
        DropGuard(self.clone())
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

pub struct DropGuard(Shutdown);

impl Drop for DropGuard {
    fn drop(&mut self) {
        self.0.trigger();
    }
}

/// Fires `shutdown` on Ctrl-C.
pub fn install_interrupt_handler(shutdown: Shutdown) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        if shutdown.trigger() {
            info!("caught interrupt, shutting down");
        }
    })
}
