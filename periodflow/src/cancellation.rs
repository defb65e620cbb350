//! Cooperative cancellation.
//!
//! Long-running steps poll the token at safe points (the downloader checks
//! it between batches), so an interrupt never tears a checkpoint.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    reason: RwLock<Option<String>>,
}

/// A cloneable handle for requesting and observing cancellation.
///
/// Cancellation is idempotent: only the first reason is kept.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    /// Creates a token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self, reason: impl Into<String>) {
        if self
            .inner
            .cancelled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let reason = reason.into();
            tracing::info!(reason = %reason, "Cancellation requested");
            *self.inner.reason.write() = Some(reason);
        }
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// The first cancellation reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.inner.reason.read().clone()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_default_not_cancelled() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.reason().is_none());
    }

    #[test]
    fn test_first_reason_wins() {
        let token = CancellationToken::new();
        token.cancel("interrupt");
        token.cancel("timeout");

        assert!(token.is_cancelled());
        assert_eq!(token.reason(), Some("interrupt".to_string()));
    }

    #[test]
    fn test_clones_share_state() {
        let token = CancellationToken::new();
        let handle = token.clone();
        handle.cancel("stop");
        assert!(token.is_cancelled());
    }
}
