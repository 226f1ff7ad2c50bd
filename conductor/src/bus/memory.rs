//! In-process message bus with full stream semantics.
//!
//! Used by tests and single-process deployments. Consumer groups, pending
//! lists, delivery counts and dead-letter streams behave like the Redis
//! adapter; [`InMemoryBus::set_available`] simulates a transport outage.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{
    dead_letter_body, dead_letter_stream_for, stream_name_for, BusError, BusMessage,
    GroupCheckpoint, GroupStart, MessageBus, MessageHandler, PublishOptions, PublishReceipt,
    RawPayload, StreamEntry, StreamPosition, StreamRead, SubscriptionId,
};

#[derive(Debug)]
struct StoredEntry {
    seq: u64,
    id: String,
    payload: RawPayload,
}

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct GroupState {
    last_delivered: Option<u64>,
    pending: BTreeMap<u64, PendingEntry>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: Vec<StoredEntry>,
    groups: HashMap<String, GroupState>,
}

#[derive(Debug)]
struct Subscriber {
    id: SubscriptionId,
    sender: mpsc::UnboundedSender<BusMessage>,
}

/// In-memory [`MessageBus`].
#[derive(Debug)]
pub struct InMemoryBus {
    available: AtomicBool,
    next_seq: AtomicU64,
    subscribers: DashMap<String, Vec<Subscriber>>,
    streams: Mutex<HashMap<String, StreamState>>,
    published: Mutex<Vec<(String, serde_json::Value)>>,
    appended: Notify,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self {
            available: AtomicBool::new(true),
            next_seq: AtomicU64::new(1),
            subscribers: DashMap::new(),
            streams: Mutex::new(HashMap::new()),
            published: Mutex::new(Vec::new()),
            appended: Notify::new(),
        }
    }
}

fn parse_seq(id: &str) -> Option<u64> {
    id.split('-').next()?.parse().ok()
}

impl InMemoryBus {
    /// Creates an empty, available bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        self.appended.notify_waiters();
    }

    /// Returns true unless an outage is being simulated.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), BusError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(BusError::Unavailable("in-memory bus is offline".into()))
        }
    }

    /// Appends an entry with an arbitrary payload shape, bypassing publish.
    pub fn append_raw(&self, stream: &str, payload: RawPayload) -> String {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let id = format!("{seq}-0");
        self.streams
            .lock()
            .entry(stream.to_string())
            .or_default()
            .entries
            .push(StoredEntry {
                seq,
                id: id.clone(),
                payload,
            });
        self.appended.notify_waiters();
        id
    }

    /// Every entry ever appended to `stream`, in order.
    #[must_use]
    pub fn stream_entries(&self, stream: &str) -> Vec<StreamEntry> {
        self.streams.lock().get(stream).map_or_else(Vec::new, |state| {
            state
                .entries
                .iter()
                .map(|entry| StreamEntry {
                    id: entry.id.clone(),
                    payload: entry.payload.clone(),
                    delivery_count: 0,
                })
                .collect()
        })
    }

    /// Payloads published on `topic`, in order.
    #[must_use]
    pub fn published(&self, topic: &str) -> Vec<serde_json::Value> {
        self.published
            .lock()
            .iter()
            .filter(|(published_topic, _)| published_topic == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Live subscribers on `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers.get(topic).map_or(0, |subs| subs.len())
    }

    fn read_now(&self, read: &StreamRead) -> Result<Vec<StreamEntry>, BusError> {
        let mut streams = self.streams.lock();
        let no_group = || BusError::NoGroup {
            stream: read.stream.clone(),
            group: read.group.clone(),
        };
        let state = streams.get_mut(&read.stream).ok_or_else(no_group)?;
        let StreamState { entries, groups } = state;
        let group = groups.get_mut(&read.group).ok_or_else(no_group)?;

        let mut out = Vec::new();
        match read.position {
            StreamPosition::Pending => {
                for (seq, pending) in &mut group.pending {
                    if out.len() >= read.count {
                        break;
                    }
                    if pending.consumer != read.consumer {
                        continue;
                    }
                    let Some(entry) = entries.iter().find(|entry| entry.seq == *seq) else {
                        continue;
                    };
                    pending.delivery_count += 1;
                    out.push(StreamEntry {
                        id: entry.id.clone(),
                        payload: entry.payload.clone(),
                        delivery_count: pending.delivery_count,
                    });
                }
            }
            StreamPosition::New => {
                let after = group.last_delivered.unwrap_or(0);
                for entry in entries.iter().filter(|entry| entry.seq > after).take(read.count) {
                    group.pending.insert(
                        entry.seq,
                        PendingEntry {
                            consumer: read.consumer.clone(),
                            delivery_count: 1,
                        },
                    );
                    group.last_delivered = Some(entry.seq);
                    out.push(StreamEntry {
                        id: entry.id.clone(),
                        payload: entry.payload.clone(),
                        delivery_count: 1,
                    });
                }
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(
        &self,
        topic: &str,
        payload: &serde_json::Value,
        options: PublishOptions,
    ) -> Result<PublishReceipt, BusError> {
        self.check_available()?;
        self.published
            .lock()
            .push((topic.to_string(), payload.clone()));

        let mut receivers = 0;
        if let Some(mut subscribers) = self.subscribers.get_mut(topic) {
            subscribers.retain(|subscriber| {
                let delivered = subscriber
                    .sender
                    .send(BusMessage::live(topic, payload.clone()))
                    .is_ok();
                receivers += usize::from(delivered);
                delivered
            });
        }

        let stream_entry_id = options.durable.then(|| {
            self.append_raw(&stream_name_for(topic), RawPayload::Structured(payload.clone()))
        });

        debug!(topic, receivers, durable = options.durable, "Published message");
        Ok(PublishReceipt {
            topic: topic.to_string(),
            receivers,
            stream_entry_id,
        })
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionId, BusError> {
        self.check_available()?;
        let id = SubscriptionId::generate();
        let (sender, mut receiver) = mpsc::unbounded_channel::<BusMessage>();

        tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                if let Err(err) = handler.handle(&message).await {
                    warn!(topic = %message.topic, error = %err, "Subscriber failed to handle message");
                }
            }
        });

        self.subscribers
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber {
                id: id.clone(),
                sender,
            });
        Ok(id)
    }

    async fn unsubscribe(&self, id: &SubscriptionId) -> Result<bool, BusError> {
        let mut removed = false;
        for mut subscribers in self.subscribers.iter_mut() {
            let before = subscribers.len();
            subscribers.retain(|subscriber| &subscriber.id != id);
            removed |= subscribers.len() != before;
        }
        Ok(removed)
    }

    async fn ensure_group(
        &self,
        stream: &str,
        group: &str,
        start: GroupStart,
    ) -> Result<(), BusError> {
        self.check_available()?;
        let mut streams = self.streams.lock();
        let state = streams.entry(stream.to_string()).or_default();
        let last_seq = state.entries.last().map(|entry| entry.seq);
        state
            .groups
            .entry(group.to_string())
            .or_insert_with(|| GroupState {
                last_delivered: match start {
                    GroupStart::Beginning => None,
                    GroupStart::Latest => last_seq,
                },
                pending: BTreeMap::new(),
            });
        Ok(())
    }

    async fn consume_stream(&self, read: &StreamRead) -> Result<Vec<StreamEntry>, BusError> {
        let deadline = read.block.map(|block| Instant::now() + block);
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.check_available()?;
            let entries = self.read_now(read)?;
            if !entries.is_empty() || read.position == StreamPosition::Pending {
                return Ok(entries);
            }
            let Some(deadline) = deadline else {
                return Ok(entries);
            };
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<usize, BusError> {
        self.check_available()?;
        let mut streams = self.streams.lock();
        let Some(group_state) = streams
            .get_mut(stream)
            .and_then(|state| state.groups.get_mut(group))
        else {
            return Ok(0);
        };
        Ok(ids
            .iter()
            .filter_map(|id| parse_seq(id))
            .filter(|seq| group_state.pending.remove(seq).is_some())
            .count())
    }

    async fn dead_letter(
        &self,
        stream: &str,
        entry: &StreamEntry,
        reason: &str,
    ) -> Result<String, BusError> {
        self.check_available()?;
        let body = dead_letter_body(stream, entry, reason);
        Ok(self.append_raw(&dead_letter_stream_for(stream), RawPayload::Structured(body)))
    }

    async fn group_checkpoint(
        &self,
        stream: &str,
        group: &str,
    ) -> Result<GroupCheckpoint, BusError> {
        self.check_available()?;
        let streams = self.streams.lock();
        let group_state = streams
            .get(stream)
            .and_then(|state| state.groups.get(group))
            .ok_or_else(|| BusError::NoGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            })?;
        Ok(GroupCheckpoint {
            stream: stream.to_string(),
            group: group.to_string(),
            last_delivered_id: group_state.last_delivered.map(|seq| format!("{seq}-0")),
            pending: group_state.pending.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingHandler;
    use serde_json::json;
    use std::time::Duration;

    fn read(position: StreamPosition) -> StreamRead {
        StreamRead {
            stream: "stream:results".into(),
            group: "orchestrator".into(),
            consumer: "c1".into(),
            position,
            count: 10,
            block: None,
        }
    }

    #[tokio::test]
    async fn test_publish_fans_out_to_subscribers() {
        let bus = InMemoryBus::new();
        let handler = Arc::new(RecordingHandler::new());
        bus.subscribe("tasks.compiler", handler.clone()).await.unwrap();

        let receipt = bus
            .publish("tasks.compiler", &json!({"n": 1}), PublishOptions::ephemeral())
            .await
            .unwrap();
        assert_eq!(receipt.receivers, 1);
        assert!(receipt.stream_entry_id.is_none());

        handler.wait_for(1, Duration::from_secs(1)).await;
        assert_eq!(handler.payloads(), vec![json!({"n": 1})]);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = InMemoryBus::new();
        let handler = Arc::new(RecordingHandler::new());
        let id = bus.subscribe("t", handler.clone()).await.unwrap();
        assert!(bus.unsubscribe(&id).await.unwrap());
        assert!(!bus.unsubscribe(&id).await.unwrap());

        let receipt = bus.publish("t", &json!(1), PublishOptions::ephemeral()).await.unwrap();
        assert_eq!(receipt.receivers, 0);
        assert_eq!(bus.subscriber_count("t"), 0);
    }

    #[tokio::test]
    async fn test_durable_publish_and_group_read() {
        let bus = InMemoryBus::new();
        bus.ensure_group("stream:results", "orchestrator", GroupStart::Beginning)
            .await
            .unwrap();
        let receipt = bus
            .publish("results", &json!({"task_id": "t1"}), PublishOptions::durable())
            .await
            .unwrap();
        let entry_id = receipt.stream_entry_id.unwrap();

        let entries = bus.consume_stream(&read(StreamPosition::New)).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, entry_id);
        assert_eq!(entries[0].payload, RawPayload::Structured(json!({"task_id": "t1"})));

        // Delivered once; a second New read sees nothing.
        assert!(bus.consume_stream(&read(StreamPosition::New)).await.unwrap().is_empty());

        let checkpoint = bus.group_checkpoint("stream:results", "orchestrator").await.unwrap();
        assert_eq!(checkpoint.pending, 1);
        assert_eq!(checkpoint.last_delivered_id.as_deref(), Some(entry_id.as_str()));
    }

    #[tokio::test]
    async fn test_pending_redelivery_until_ack() {
        let bus = InMemoryBus::new();
        bus.ensure_group("stream:results", "orchestrator", GroupStart::Beginning)
            .await
            .unwrap();
        bus.append_raw("stream:results", RawPayload::Text("{}".into()));

        let first = bus.consume_stream(&read(StreamPosition::New)).await.unwrap();
        let pending = bus.consume_stream(&read(StreamPosition::Pending)).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, first[0].id);
        assert_eq!(pending[0].delivery_count, 2);

        let acked = bus
            .ack("stream:results", "orchestrator", &[first[0].id.clone()])
            .await
            .unwrap();
        assert_eq!(acked, 1);
        assert!(bus.consume_stream(&read(StreamPosition::Pending)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pending_is_per_consumer() {
        let bus = InMemoryBus::new();
        bus.ensure_group("stream:results", "orchestrator", GroupStart::Beginning)
            .await
            .unwrap();
        bus.append_raw("stream:results", RawPayload::Text("{}".into()));
        bus.consume_stream(&read(StreamPosition::New)).await.unwrap();

        let mut other = read(StreamPosition::Pending);
        other.consumer = "c2".into();
        assert!(bus.consume_stream(&other).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_group_start_latest_skips_history() {
        let bus = InMemoryBus::new();
        bus.append_raw("stream:results", RawPayload::Text("{}".into()));
        bus.ensure_group("stream:results", "orchestrator", GroupStart::Latest)
            .await
            .unwrap();
        assert!(bus.consume_stream(&read(StreamPosition::New)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_group_is_an_error() {
        let bus = InMemoryBus::new();
        let err = bus.consume_stream(&read(StreamPosition::New)).await.unwrap_err();
        assert!(matches!(err, BusError::NoGroup { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_read_wakes_on_append() {
        let bus = Arc::new(InMemoryBus::new());
        bus.ensure_group("stream:results", "orchestrator", GroupStart::Beginning)
            .await
            .unwrap();

        let reader = {
            let bus = bus.clone();
            tokio::spawn(async move {
                let mut blocking = read(StreamPosition::New);
                blocking.block = Some(Duration::from_secs(5));
                bus.consume_stream(&blocking).await
            })
        };
        tokio::task::yield_now().await;
        bus.append_raw("stream:results", RawPayload::Text("{}".into()));

        let entries = reader.await.unwrap().unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_read_times_out_empty() {
        let bus = InMemoryBus::new();
        bus.ensure_group("stream:results", "orchestrator", GroupStart::Beginning)
            .await
            .unwrap();
        let mut blocking = read(StreamPosition::New);
        blocking.block = Some(Duration::from_millis(200));
        assert!(bus.consume_stream(&blocking).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_outage_fails_operations() {
        let bus = InMemoryBus::new();
        bus.set_available(false);
        let err = bus
            .publish("results", &json!({}), PublishOptions::durable())
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(bus.consume_stream(&read(StreamPosition::New)).await.is_err());

        bus.set_available(true);
        assert!(bus.publish("results", &json!({}), PublishOptions::durable()).await.is_ok());
    }

    #[tokio::test]
    async fn test_dead_letter_appends_to_side_stream() {
        let bus = InMemoryBus::new();
        let entry = StreamEntry {
            id: "3-0".into(),
            payload: RawPayload::Text("garbage".into()),
            delivery_count: 1,
        };
        bus.dead_letter("stream:results", &entry, "invalid json").await.unwrap();

        let dead = bus.stream_entries("stream:results:dead_letter");
        assert_eq!(dead.len(), 1);
        let RawPayload::Structured(body) = &dead[0].payload else {
            panic!("dead letter body should be structured");
        };
        assert_eq!(body["reason"], "invalid json");
        assert_eq!(body["payload"], "garbage");
    }
}
