use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;

/// Cloneable handle for pausing or cancelling a running transfer from any
/// task. Both requests are honoured between chunks.
#[derive(Debug, Clone, Default)]
pub struct TransferControl {
    pause: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl TransferControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_pause(&self) {
        self.pause.store(true, Ordering::SeqCst);
    }

    pub fn request_cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_pause_requested(&self) -> bool {
        self.pause.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token that fires when cancellation is requested.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn clear_pause(&self) {
        self.pause.store(false, Ordering::SeqCst);
    }
}
