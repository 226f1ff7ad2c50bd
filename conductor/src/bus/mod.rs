//! Message bus port.
//!
//! Two delivery modes share one trait:
//!
//! - publish/subscribe: fan-out to live subscribers, at-most-once, used for
//!   routing task envelopes to workers
//! - durable streams with consumer groups: at-least-once, replayable, used for
//!   results. An entry stays pending until every handler accepted it.
//!
//! The orchestration core depends only on [`MessageBus`]; [`InMemoryBus`] and,
//! behind the `redis` feature, `RedisBus` are interchangeable adapters.

#[cfg_attr(not(feature = "redis"), allow(dead_code))]
mod live;
mod memory;
mod payload;
#[cfg(feature = "redis")]
mod redis;
mod subscription;

pub use memory::InMemoryBus;
pub use payload::{PayloadError, RawPayload};
#[cfg(feature = "redis")]
pub use self::redis::RedisBus;
pub use subscription::{DrainReport, StreamSubscription, StreamSubscriptionConfig};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::errors::{ConductorError, ContractViolation};
use crate::utils::generate_id;

const STREAM_PREFIX: &str = "stream:";
const DEAD_LETTER_SUFFIX: &str = ":dead_letter";

/// Durable stream mirroring `topic`, e.g. `stream:results`.
#[must_use]
pub fn stream_name_for(topic: &str) -> String {
    format!("{STREAM_PREFIX}{topic}")
}

/// Dead-letter stream for `stream`, e.g. `stream:results:dead_letter`.
#[must_use]
pub fn dead_letter_stream_for(stream: &str) -> String {
    format!("{stream}{DEAD_LETTER_SUFFIX}")
}

/// Errors raised by bus adapters.
#[derive(Debug, Error)]
pub enum BusError {
    /// The transport is unreachable.
    #[error("Bus unavailable: {0}")]
    Unavailable(String),

    /// The consumer group does not exist on the stream.
    #[error("Consumer group '{group}' does not exist on '{stream}'")]
    NoGroup {
        /// Stream name.
        stream: String,
        /// Group name.
        group: String,
    },

    /// A message failed envelope validation.
    #[error("{0}")]
    Contract(#[from] ContractViolation),

    /// A payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Redis returned an error.
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

impl BusError {
    /// Returns true for errors a reconnect may fix.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) => true,
            #[cfg(feature = "redis")]
            Self::Redis(_) => true,
            _ => false,
        }
    }
}

/// Options for [`MessageBus::publish`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Also append the message to the topic's durable stream.
    pub durable: bool,
}

impl PublishOptions {
    /// Fan-out only.
    #[must_use]
    pub fn ephemeral() -> Self {
        Self { durable: false }
    }

    /// Fan-out plus a durable stream entry.
    #[must_use]
    pub fn durable() -> Self {
        Self { durable: true }
    }
}

/// Outcome of a publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Topic published to.
    pub topic: String,
    /// Live subscribers that received the message, when the transport knows.
    pub receivers: usize,
    /// Stream entry id when the message was mirrored.
    pub stream_entry_id: Option<String>,
}

/// Handle returned by [`MessageBus::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    /// Fresh unique id.
    #[must_use]
    pub fn generate() -> Self {
        Self(generate_id())
    }

    /// The id as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message handed to a [`MessageHandler`].
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    /// Topic the message was published on, or the stream it was read from.
    pub topic: String,
    /// Decoded payload.
    pub payload: serde_json::Value,
    /// Stream entry id for durable deliveries.
    pub entry_id: Option<String>,
    /// Times the entry has been delivered, including this one.
    pub delivery_count: u32,
}

impl BusMessage {
    /// Message received through publish/subscribe.
    #[must_use]
    pub fn live(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
            entry_id: None,
            delivery_count: 1,
        }
    }
}

/// Long-lived consumer of bus messages.
///
/// Returning `Err` from a durable delivery leaves the entry pending so it is
/// redelivered.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handles one message.
    async fn handle(&self, message: &BusMessage) -> Result<(), ConductorError>;
}

/// Where a stream read starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPosition {
    /// Entries never delivered to the group.
    New,
    /// Entries delivered to this consumer but not acknowledged.
    Pending,
}

/// Where a new consumer group starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupStart {
    /// Every entry already in the stream.
    #[default]
    Beginning,
    /// Only entries appended after the group was created.
    Latest,
}

/// Parameters of [`MessageBus::consume_stream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRead {
    /// Stream name.
    pub stream: String,
    /// Consumer group.
    pub group: String,
    /// Consumer name within the group.
    pub consumer: String,
    /// Read position.
    pub position: StreamPosition,
    /// Maximum entries returned.
    pub count: usize,
    /// Long-poll timeout for [`StreamPosition::New`]; `None` returns at once.
    pub block: Option<Duration>,
}

/// One durable stream entry.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    /// Entry id, monotonic within the stream.
    pub id: String,
    /// Payload as stored by the transport.
    pub payload: RawPayload,
    /// Times the entry has been delivered to the group, including this read.
    pub delivery_count: u32,
}

/// Progress of a consumer group on a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupCheckpoint {
    /// Stream name.
    pub stream: String,
    /// Group name.
    pub group: String,
    /// Id of the last entry delivered to the group.
    pub last_delivered_id: Option<String>,
    /// Delivered but unacknowledged entries.
    pub pending: usize,
}

/// Transport abstraction used by the dispatcher, the result consumer and
/// workers.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publishes `payload` to `topic`.
    async fn publish(
        &self,
        topic: &str,
        payload: &serde_json::Value,
        options: PublishOptions,
    ) -> Result<PublishReceipt, BusError>;

    /// Registers `handler` for every message published on `topic`.
    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionId, BusError>;

    /// Removes a subscription. Returns false if it was unknown.
    async fn unsubscribe(&self, id: &SubscriptionId) -> Result<bool, BusError>;

    /// Creates the consumer group (and the stream) if missing.
    async fn ensure_group(&self, stream: &str, group: &str, start: GroupStart)
        -> Result<(), BusError>;

    /// Reads entries for a consumer group.
    async fn consume_stream(&self, read: &StreamRead) -> Result<Vec<StreamEntry>, BusError>;

    /// Acknowledges entries. Returns how many were pending.
    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<usize, BusError>;

    /// Copies `entry` to the stream's dead-letter stream. Returns the new entry id.
    async fn dead_letter(
        &self,
        stream: &str,
        entry: &StreamEntry,
        reason: &str,
    ) -> Result<String, BusError>;

    /// Current checkpoint of a consumer group.
    async fn group_checkpoint(&self, stream: &str, group: &str)
        -> Result<GroupCheckpoint, BusError>;
}

/// Body written to a dead-letter stream.
pub(crate) fn dead_letter_body(
    stream: &str,
    entry: &StreamEntry,
    reason: &str,
) -> serde_json::Value {
    serde_json::json!({
        "source_stream": stream,
        "entry_id": entry.id,
        "delivery_count": entry.delivery_count,
        "reason": reason,
        "payload_shape": entry.payload.shape(),
        "payload": entry.payload.to_lossy_text(),
        "dead_lettered_at": crate::utils::now_utc(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_names_are_deterministic() {
        assert_eq!(stream_name_for("results"), "stream:results");
        assert_eq!(
            dead_letter_stream_for(&stream_name_for("results")),
            "stream:results:dead_letter"
        );
    }

    #[test]
    fn test_publish_options() {
        assert!(PublishOptions::durable().durable);
        assert!(!PublishOptions::ephemeral().durable);
        assert_eq!(PublishOptions::default(), PublishOptions::ephemeral());
    }

    #[test]
    fn test_bus_error_classification() {
        assert!(BusError::Unavailable("down".into()).is_transient());
        assert!(!BusError::NoGroup {
            stream: "s".into(),
            group: "g".into()
        }
        .is_transient());
    }

    #[test]
    fn test_dead_letter_body() {
        let entry = StreamEntry {
            id: "7-0".into(),
            payload: RawPayload::Text("{broken".into()),
            delivery_count: 1,
        };
        let body = dead_letter_body("stream:results", &entry, "invalid json");
        assert_eq!(body["entry_id"], "7-0");
        assert_eq!(body["payload"], "{broken");
        assert_eq!(body["payload_shape"], "text");
    }
}
