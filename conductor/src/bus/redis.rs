//! Redis adapter: pub/sub for fan-out, Redis Streams for durable delivery.
//!
//! Stream entries carry the JSON text in a single `payload` field. Entries
//! written by other producers may instead carry structured fields; those are
//! surfaced as [`RawPayload::Structured`].

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamId, StreamInfoGroupsReply, StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};
use redis::{AsyncCommands, RedisError, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::live::{run_live_subscription, LiveFrames};
use super::{
    dead_letter_body, dead_letter_stream_for, stream_name_for, BusError, BusMessage,
    GroupCheckpoint, GroupStart, MessageBus, MessageHandler, PublishOptions, PublishReceipt,
    RawPayload, StreamEntry, StreamPosition, StreamRead, SubscriptionId,
};
use crate::resilience::RetryConfig;

const PAYLOAD_FIELD: &str = "payload";

/// [`MessageBus`] backed by Redis.
pub struct RedisBus {
    client: redis::Client,
    redis: ConnectionManager,
    reconnect: RetryConfig,
    subscriptions: DashMap<SubscriptionId, JoinHandle<()>>,
}

impl std::fmt::Debug for RedisBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBus")
            .field("subscriptions", &self.subscriptions.len())
            .finish_non_exhaustive()
    }
}

impl RedisBus {
    /// Connects to `redis_url`, e.g. `redis://localhost:6379`.
    pub async fn connect(redis_url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(redis_url)
            .map_err(|err| BusError::Unavailable(err.to_string()))?;
        let redis = ConnectionManager::new(client.clone())
            .await
            .map_err(|err| BusError::Unavailable(err.to_string()))?;
        Ok(Self::from_connection(client, redis))
    }

    /// Wraps an existing client and connection manager.
    #[must_use]
    pub fn from_connection(client: redis::Client, redis: ConnectionManager) -> Self {
        Self {
            client,
            redis,
            reconnect: RetryConfig::unbounded(),
            subscriptions: DashMap::new(),
        }
    }

    /// Sets the resubscribe policy of pub/sub subscriptions. Unbounded by default.
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: RetryConfig) -> Self {
        self.reconnect = reconnect;
        self
    }
}

/// Opens a dedicated pub/sub connection subscribed to `topic`.
async fn open_live(client: &redis::Client, topic: &str) -> Result<LiveFrames, BusError> {
    let mut pubsub = client.get_async_connection().await?.into_pubsub();
    pubsub.subscribe(topic).await?;
    Ok(pubsub
        .into_on_message()
        .map(|message| message.get_payload::<String>().map_err(|err| err.to_string()))
        .boxed())
}

fn map_group_error(err: RedisError, stream: &str, group: &str) -> BusError {
    if err.code() == Some("NOGROUP") {
        BusError::NoGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        }
    } else {
        BusError::Redis(err)
    }
}

/// Converts a Redis reply value to JSON without parsing any text.
fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Nil => serde_json::Value::Null,
        Value::Int(n) => serde_json::Value::from(*n),
        Value::Data(bytes) => serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned()),
        Value::Bulk(items) => serde_json::Value::Array(items.iter().map(value_to_json).collect()),
        Value::Status(status) => serde_json::Value::String(status.clone()),
        Value::Okay => serde_json::Value::String("OK".into()),
    }
}

fn payload_from_fields(fields: &HashMap<String, Value>) -> RawPayload {
    match fields.get(PAYLOAD_FIELD) {
        Some(Value::Data(bytes)) => RawPayload::Bytes(bytes.clone()),
        Some(other) => RawPayload::Structured(value_to_json(other)),
        None => RawPayload::Structured(serde_json::Value::Object(
            fields
                .iter()
                .map(|(key, value)| (key.clone(), value_to_json(value)))
                .collect(),
        )),
    }
}

fn entry_from_stream_id(stream_id: &StreamId, delivery_count: u32) -> StreamEntry {
    StreamEntry {
        id: stream_id.id.clone(),
        payload: payload_from_fields(&stream_id.map),
        delivery_count,
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn publish(
        &self,
        topic: &str,
        payload: &serde_json::Value,
        options: PublishOptions,
    ) -> Result<PublishReceipt, BusError> {
        let text = serde_json::to_string(payload)?;
        let mut conn = self.redis.clone();

        let stream_entry_id = if options.durable {
            let id: String = conn
                .xadd(stream_name_for(topic), "*", &[(PAYLOAD_FIELD, text.as_str())])
                .await?;
            Some(id)
        } else {
            None
        };
        let receivers: i64 = conn.publish(topic, &text).await?;

        debug!(topic, receivers, durable = options.durable, "Published message");
        Ok(PublishReceipt {
            topic: topic.to_string(),
            receivers: usize::try_from(receivers).unwrap_or(0),
            stream_entry_id,
        })
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionId, BusError> {
        let first = open_live(&self.client, topic).await?;

        let client = self.client.clone();
        let topic_name = topic.to_string();
        let handle = tokio::spawn(run_live_subscription(
            topic.to_string(),
            handler,
            self.reconnect.clone(),
            first,
            move || {
                let client = client.clone();
                let topic = topic_name.clone();
                async move { open_live(&client, &topic).await }
            },
        ));

        let id = SubscriptionId::generate();
        self.subscriptions.insert(id.clone(), handle);
        Ok(id)
    }

    async fn unsubscribe(&self, id: &SubscriptionId) -> Result<bool, BusError> {
        Ok(self
            .subscriptions
            .remove(id)
            .map(|(_, handle)| handle.abort())
            .is_some())
    }

    async fn ensure_group(
        &self,
        stream: &str,
        group: &str,
        start: GroupStart,
    ) -> Result<(), BusError> {
        let start_id = match start {
            GroupStart::Beginning => "0",
            GroupStart::Latest => "$",
        };
        let mut conn = self.redis.clone();
        match conn
            .xgroup_create_mkstream::<_, _, _, ()>(stream, group, start_id)
            .await
        {
            Ok(()) => Ok(()),
            Err(err) if err.code() == Some("BUSYGROUP") => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn consume_stream(&self, read: &StreamRead) -> Result<Vec<StreamEntry>, BusError> {
        let mut conn = self.redis.clone();
        let mut options = StreamReadOptions::default()
            .group(&read.group, &read.consumer)
            .count(read.count);
        let start_id = match read.position {
            StreamPosition::New => {
                if let Some(block) = read.block {
                    options = options.block(usize::try_from(block.as_millis()).unwrap_or(usize::MAX));
                }
                ">"
            }
            StreamPosition::Pending => "0",
        };

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&read.stream], &[start_id], &options)
            .await
            .map_err(|err| map_group_error(err, &read.stream, &read.group))?;
        let ids: Vec<StreamId> = reply
            .map(|reply| reply.keys.into_iter().flat_map(|key| key.ids).collect())
            .unwrap_or_default();

        if read.position == StreamPosition::New || ids.is_empty() {
            return Ok(ids.iter().map(|id| entry_from_stream_id(id, 1)).collect());
        }

        let first = ids.first().map_or("-", |id| id.id.as_str());
        let last = ids.last().map_or("+", |id| id.id.as_str());
        let pending: StreamPendingCountReply = conn
            .xpending_consumer_count(&read.stream, &read.group, first, last, ids.len(), &read.consumer)
            .await?;
        let counts: HashMap<&str, u32> = pending
            .ids
            .iter()
            .map(|p| (p.id.as_str(), u32::try_from(p.times_delivered).unwrap_or(u32::MAX)))
            .collect();

        Ok(ids
            .iter()
            .map(|id| entry_from_stream_id(id, counts.get(id.id.as_str()).copied().unwrap_or(1)))
            .collect())
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<usize, BusError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.redis.clone();
        Ok(conn.xack(stream, group, ids).await?)
    }

    async fn dead_letter(
        &self,
        stream: &str,
        entry: &StreamEntry,
        reason: &str,
    ) -> Result<String, BusError> {
        let body = serde_json::to_string(&dead_letter_body(stream, entry, reason))?;
        let mut conn = self.redis.clone();
        Ok(conn
            .xadd(dead_letter_stream_for(stream), "*", &[(PAYLOAD_FIELD, body.as_str())])
            .await?)
    }

    async fn group_checkpoint(
        &self,
        stream: &str,
        group: &str,
    ) -> Result<GroupCheckpoint, BusError> {
        let mut conn = self.redis.clone();
        let reply: StreamInfoGroupsReply = conn.xinfo_groups(stream).await?;
        let info = reply
            .groups
            .into_iter()
            .find(|info| info.name == group)
            .ok_or_else(|| BusError::NoGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            })?;
        Ok(GroupCheckpoint {
            stream: stream.to_string(),
            group: group.to_string(),
            last_delivered_id: (info.last_delivered_id != "0-0").then_some(info.last_delivered_id),
            pending: info.pending,
        })
    }
}
