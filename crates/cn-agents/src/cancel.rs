use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// CancellationToken
// ---------------------------------------------------------------------------

/// Cooperative cancellation for one plan execution.
///
/// Cancelling stops the scheduler before its next stage. Tasks already
/// dispatched are not recalled.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    notify: broadcast::Sender<()>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(1);
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            notify,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn cancel(&self) {
        if self
            .cancelled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            info!("execution cancelled");
            let _ = self.notify.send(());
        } else {
            debug!("execution already cancelled");
        }
    }

    /// Resolves once [`cancel`](Self::cancel) has been called, immediately if
    /// it already was.
    pub async fn cancelled(&self) {
        let mut rx = self.notify.subscribe();
        if self.is_cancelled() {
            return;
        }
        let _ = rx.recv().await;
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}
