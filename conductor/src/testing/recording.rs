//! A message handler that records what it receives.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

use crate::bus::{BusMessage, MessageHandler};
use crate::errors::ConductorError;

/// Records accepted payloads; can be told to fail the next calls.
#[derive(Debug, Default)]
pub struct RecordingHandler {
    payloads: Mutex<Vec<serde_json::Value>>,
    calls: AtomicUsize,
    failures_left: AtomicUsize,
    notify: Notify,
}

impl RecordingHandler {
    /// Creates a handler that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Payloads of successful calls, in order.
    #[must_use]
    pub fn payloads(&self) -> Vec<serde_json::Value> {
        self.payloads.lock().clone()
    }

    /// Every call, failed ones included.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Fails the next `count` calls with a transport error.
    pub fn fail_next(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Waits until `count` payloads were accepted.
    ///
    /// # Panics
    ///
    /// Panics if that does not happen within `within`.
    pub async fn wait_for(&self, count: usize, within: Duration) {
        let waited = tokio::time::timeout(within, async {
            loop {
                let notified = self.notify.notified();
                if self.payloads.lock().len() >= count {
                    return;
                }
                notified.await;
            }
        })
        .await;
        assert!(
            waited.is_ok(),
            "expected {count} payloads within {within:?}, got {}",
            self.payloads.lock().len()
        );
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, message: &BusMessage) -> Result<(), ConductorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ConductorError::transport("scripted handler failure"));
        }
        self.payloads.lock().push(message.payload.clone());
        self.notify.notify_waiters();
        Ok(())
    }
}
