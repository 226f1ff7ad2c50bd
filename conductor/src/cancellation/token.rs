//! Shutdown token for long-lived loops.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Cooperative shutdown signal shared by subscription loops and watchdogs.
///
/// Cancellation is idempotent; only the first reason is kept. Clones share
/// the same state.
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken {
    inner: Arc<TokenState>,
}

#[derive(Debug, Default)]
struct TokenState {
    cancelled: AtomicBool,
    reason: RwLock<Option<String>>,
    notify: Notify,
}

impl ShutdownToken {
    /// Creates a new token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests shutdown.
    pub fn cancel(&self, reason: impl Into<String>) {
        if self
            .inner
            .cancelled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            *self.inner.reason.write() = Some(reason.into());
            self.inner.notify.notify_waiters();
        }
    }

    /// Returns whether shutdown has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// The first shutdown reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.inner.reason.read().clone()
    }

    /// Resolves once shutdown is requested.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_token_default_not_cancelled() {
        let token = ShutdownToken::new();
        assert!(!token.is_cancelled());
        assert!(token.reason().is_none());
    }

    #[test]
    fn test_first_reason_wins() {
        let token = ShutdownToken::new();
        token.cancel("sigterm");
        token.cancel("second");
        assert!(token.is_cancelled());
        assert_eq!(token.reason().as_deref(), Some("sigterm"));
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiters() {
        let token = ShutdownToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        tokio::task::yield_now().await;
        token.cancel("stop");
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_cancelled_pending_until_cancel() {
        let token = ShutdownToken::new();
        let mut waiter = tokio_test::task::spawn(token.cancelled());
        tokio_test::assert_pending!(waiter.poll());

        token.cancel("stop");
        assert!(waiter.is_woken());
        tokio_test::assert_ready!(waiter.poll());
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_when_already_cancelled() {
        let token = ShutdownToken::new();
        token.cancel("done");
        token.cancelled().await;
    }
}
