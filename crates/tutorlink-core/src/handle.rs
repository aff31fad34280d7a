use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use tutorlink_store::WatchToken;

/// Cancels one subscription, however many live queries it is built from.
///
/// Clones share state. The first call tears every query down in one step;
/// later calls do nothing.
#[derive(Debug, Clone)]
pub struct Unsubscribe {
    cancelled: Arc<AtomicBool>,
    tokens: Arc<[WatchToken]>,
}

impl Unsubscribe {
    pub(crate) fn new(tokens: Vec<WatchToken>) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            tokens: tokens.into(),
        }
    }

    /// Shared flag the owning stream checks before every emission.
    pub(crate) fn flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    /// Stop the subscription. Returns `false` if it was already stopped.
    pub fn unsubscribe(&self) -> bool {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return false;
        }
        WatchToken::cancel_all(&self.tokens);
        debug!(queries = self.tokens.len(), "subscription cancelled");
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
