//! Durable subscription: the at-least-once consumption loop over a stream.
//!
//! An entry is acknowledged only after every handler returned `Ok`. A failing
//! entry stays pending and is re-read from the pending list; after
//! `max_deliveries` it is dead-lettered and acknowledged. Undecodable payloads
//! are dead-lettered immediately. Transport errors back off and reconnect, and
//! every (re)connect drains this consumer's pending entries before reading new
//! ones.

use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{
    BusError, BusMessage, GroupStart, MessageBus, MessageHandler, StreamEntry, StreamPosition,
    StreamRead,
};
use crate::cancellation::ShutdownToken;
use crate::events::{EventSink, LifecycleEvent, NoOpEventSink};
use crate::resilience::{RetryConfig, RetryState};

/// Settings for one durable subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSubscriptionConfig {
    /// Stream to consume.
    pub stream: String,
    /// Consumer group.
    pub group: String,
    /// Consumer name, unique per process.
    pub consumer: String,
    /// Entries per read.
    pub batch_size: usize,
    /// Long-poll timeout for new entries.
    pub block: Duration,
    /// Failed deliveries before an entry is dead-lettered.
    pub max_deliveries: u32,
    /// Entries of one batch handled concurrently.
    pub max_in_flight: usize,
    /// Pause before re-reading pending entries after a handler failure.
    pub handler_retry_delay: Duration,
    /// Reconnect backoff. `max_attempts == 0` retries forever.
    pub reconnect: RetryConfig,
}

impl StreamSubscriptionConfig {
    /// Config with default tuning.
    #[must_use]
    pub fn new(
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Self {
        Self {
            stream: stream.into(),
            group: group.into(),
            consumer: consumer.into(),
            batch_size: 16,
            block: Duration::from_secs(5),
            max_deliveries: 5,
            max_in_flight: 8,
            handler_retry_delay: Duration::from_secs(1),
            reconnect: RetryConfig::unbounded(),
        }
    }

    /// Sets the batch size.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Sets the long-poll timeout.
    #[must_use]
    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }

    /// Sets the dead-letter threshold.
    #[must_use]
    pub fn with_max_deliveries(mut self, max_deliveries: u32) -> Self {
        self.max_deliveries = max_deliveries.max(1);
        self
    }

    /// Sets the per-batch concurrency.
    #[must_use]
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    /// Sets the pause after a handler failure.
    #[must_use]
    pub fn with_handler_retry_delay(mut self, delay: Duration) -> Self {
        self.handler_retry_delay = delay;
        self
    }

    /// Sets the reconnect policy.
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: RetryConfig) -> Self {
        self.reconnect = reconnect;
        self
    }
}

/// Counts from processing one or more batches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Entries read.
    pub read: usize,
    /// Entries acknowledged after every handler succeeded.
    pub acknowledged: usize,
    /// Entries moved to the dead-letter stream.
    pub dead_lettered: usize,
    /// Entries left pending because a handler failed.
    pub failed: usize,
}

impl DrainReport {
    fn absorb(&mut self, other: Self) {
        self.read += other.read;
        self.acknowledged += other.acknowledged;
        self.dead_lettered += other.dead_lettered;
        self.failed += other.failed;
    }
}

enum EntryOutcome {
    Acknowledged,
    DeadLettered,
    Failed,
    Transport(BusError),
}

/// At-least-once consumer of one stream for one consumer group.
pub struct StreamSubscription {
    bus: Arc<dyn MessageBus>,
    config: StreamSubscriptionConfig,
    handlers: Vec<Arc<dyn MessageHandler>>,
    events: Arc<dyn EventSink>,
    failures: Mutex<HashMap<String, u32>>,
}

impl std::fmt::Debug for StreamSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSubscription")
            .field("config", &self.config)
            .field("handlers", &self.handlers.len())
            .finish_non_exhaustive()
    }
}

impl StreamSubscription {
    /// Creates a subscription with no handlers.
    #[must_use]
    pub fn new(bus: Arc<dyn MessageBus>, config: StreamSubscriptionConfig) -> Self {
        Self {
            bus,
            config,
            handlers: Vec::new(),
            events: Arc::new(NoOpEventSink),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Adds a handler. Entries are acknowledged once all handlers succeed.
    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Sets the sink receiving `bus.dead_lettered` events.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Subscription settings.
    #[must_use]
    pub fn config(&self) -> &StreamSubscriptionConfig {
        &self.config
    }

    /// Creates the consumer group if it is missing.
    pub async fn start(&self) -> Result<(), BusError> {
        self.bus
            .ensure_group(&self.config.stream, &self.config.group, GroupStart::Beginning)
            .await
    }

    async fn read(
        &self,
        position: StreamPosition,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>, BusError> {
        self.bus
            .consume_stream(&StreamRead {
                stream: self.config.stream.clone(),
                group: self.config.group.clone(),
                consumer: self.config.consumer.clone(),
                position,
                count: self.config.batch_size,
                block,
            })
            .await
    }

    /// Reads one batch from `position` and processes it.
    pub async fn poll_once(
        &self,
        position: StreamPosition,
        block: Option<Duration>,
    ) -> Result<DrainReport, BusError> {
        let entries = self.read(position, block).await?;
        self.process_batch(entries).await
    }

    async fn process_batch(&self, entries: Vec<StreamEntry>) -> Result<DrainReport, BusError> {
        let mut report = DrainReport {
            read: entries.len(),
            ..DrainReport::default()
        };
        if entries.is_empty() {
            return Ok(report);
        }

        let outcomes: Vec<EntryOutcome> = stream::iter(entries)
            .map(|entry| self.process_entry(entry))
            .buffer_unordered(self.config.max_in_flight)
            .collect()
            .await;

        let mut transport_error = None;
        for outcome in outcomes {
            match outcome {
                EntryOutcome::Acknowledged => report.acknowledged += 1,
                EntryOutcome::DeadLettered => report.dead_lettered += 1,
                EntryOutcome::Failed => report.failed += 1,
                EntryOutcome::Transport(err) => {
                    report.failed += 1;
                    transport_error.get_or_insert(err);
                }
            }
        }
        match transport_error {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    fn prior_failures(&self, entry: &StreamEntry) -> u32 {
        let local = self.failures.lock().get(&entry.id).copied().unwrap_or(0);
        local.max(entry.delivery_count.saturating_sub(1))
    }

    async fn process_entry(&self, entry: StreamEntry) -> EntryOutcome {
        let stream = self.config.stream.as_str();

        let payload = match entry.payload.decode() {
            Ok(payload) => payload,
            Err(err) => {
                error!(
                    stream,
                    entry_id = %entry.id,
                    shape = entry.payload.shape(),
                    raw_payload = %entry.payload.to_lossy_text(),
                    error = %err,
                    "Undecodable stream payload"
                );
                return self
                    .dead_letter_and_ack(&entry, &format!("undecodable payload: {err}"))
                    .await;
            }
        };

        let prior_failures = self.prior_failures(&entry);
        if prior_failures >= self.config.max_deliveries {
            warn!(
                stream,
                entry_id = %entry.id,
                failures = prior_failures,
                "Entry exceeded max deliveries"
            );
            return self
                .dead_letter_and_ack(
                    &entry,
                    &format!("handlers failed on {prior_failures} deliveries"),
                )
                .await;
        }

        let message = BusMessage {
            topic: self.config.stream.clone(),
            payload,
            entry_id: Some(entry.id.clone()),
            delivery_count: entry.delivery_count,
        };
        for handler in &self.handlers {
            if let Err(err) = handler.handle(&message).await {
                let failures = {
                    let mut failures = self.failures.lock();
                    let count = failures.entry(entry.id.clone()).or_insert(prior_failures);
                    *count += 1;
                    *count
                };
                warn!(
                    stream,
                    entry_id = %entry.id,
                    failures,
                    error = %err,
                    "Handler failed, entry left pending"
                );
                return EntryOutcome::Failed;
            }
        }

        match self.ack(&entry.id).await {
            Ok(()) => {
                debug!(stream, entry_id = %entry.id, "Entry acknowledged");
                EntryOutcome::Acknowledged
            }
            Err(err) => EntryOutcome::Transport(err),
        }
    }

    async fn ack(&self, entry_id: &str) -> Result<(), BusError> {
        self.bus
            .ack(&self.config.stream, &self.config.group, &[entry_id.to_string()])
            .await?;
        self.failures.lock().remove(entry_id);
        Ok(())
    }

    async fn dead_letter_and_ack(&self, entry: &StreamEntry, reason: &str) -> EntryOutcome {
        let stream = self.config.stream.as_str();
        if let Err(err) = self.bus.dead_letter(stream, entry, reason).await {
            return EntryOutcome::Transport(err);
        }
        if let Err(err) = self.ack(&entry.id).await {
            return EntryOutcome::Transport(err);
        }
        error!(stream, entry_id = %entry.id, reason, "Entry dead-lettered");
        self.events.try_emit(LifecycleEvent::DeadLettered {
            stream: stream.to_string(),
            entry_id: entry.id.clone(),
            reason: reason.to_string(),
        });
        EntryOutcome::DeadLettered
    }

    async fn drain_position(&self, position: StreamPosition) -> Result<DrainReport, BusError> {
        let mut total = DrainReport::default();
        loop {
            let report = self.poll_once(position, None).await?;
            total.absorb(report);
            if report.read == 0 {
                return Ok(total);
            }
            if report.failed > 0 && position == StreamPosition::Pending {
                tokio::time::sleep(self.config.handler_retry_delay).await;
            }
        }
    }

    /// Processes everything readable right now without blocking.
    ///
    /// Pending entries first, then new ones; repeats while new entries
    /// fail so nothing is left unprocessed except dead letters.
    pub async fn drain(&self) -> Result<DrainReport, BusError> {
        self.start().await?;
        let mut total = DrainReport::default();
        loop {
            total.absorb(self.drain_position(StreamPosition::Pending).await?);
            let fresh = self.drain_position(StreamPosition::New).await?;
            total.absorb(fresh);
            if fresh.failed == 0 {
                return Ok(total);
            }
        }
    }

    /// Consumes until `shutdown` fires.
    pub async fn run(&self, shutdown: ShutdownToken) {
        let stream = self.config.stream.as_str();
        let mut reconnect = RetryState::new();
        let mut ready = false;
        let mut position = StreamPosition::Pending;
        info!(stream, group = %self.config.group, consumer = %self.config.consumer, "Stream subscription started");

        while !shutdown.is_cancelled() {
            // `None` means the group was (re)created and nothing was read yet.
            let step = if ready {
                let block = (position == StreamPosition::New).then_some(self.config.block);
                let read = tokio::select! {
                    () = shutdown.cancelled() => break,
                    read = self.read(position, block) => read,
                };
                match read {
                    Ok(entries) => self.process_batch(entries).await.map(Some),
                    Err(err) => Err(err),
                }
            } else {
                self.start().await.map(|()| None)
            };

            match step {
                Ok(None) => ready = true,
                Ok(Some(report)) => {
                    if reconnect.attempt > 0 {
                        info!(stream, attempts = reconnect.attempt, "Stream subscription reconnected");
                        reconnect.reset();
                    }
                    if report.failed > 0 {
                        position = StreamPosition::Pending;
                        tokio::select! {
                            () = shutdown.cancelled() => break,
                            () = tokio::time::sleep(self.config.handler_retry_delay) => {}
                        }
                    } else if position == StreamPosition::Pending && report.read == 0 {
                        position = StreamPosition::New;
                    }
                }
                Err(err) => {
                    position = StreamPosition::Pending;
                    if matches!(err, BusError::NoGroup { .. }) {
                        ready = false;
                    }
                    let Some(delay) = reconnect.next_delay(&self.config.reconnect) else {
                        error!(stream, error = %err, "Stream subscription giving up");
                        break;
                    };
                    warn!(
                        stream,
                        error = %err,
                        attempt = reconnect.attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Stream read failed, reconnecting"
                    );
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        info!(stream, "Stream subscription stopped");
    }

    /// Runs the subscription on a background task.
    pub fn spawn(self: Arc<Self>, shutdown: ShutdownToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}
