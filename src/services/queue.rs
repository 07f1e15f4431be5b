//! Task streams with consumer-group semantics.
//!
//! Entries are claimed by exactly one consumer in a group, stay pending until
//! acknowledged, and become reclaimable once idle past the visibility window.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamPendingReply, StreamReadOptions,
    StreamReadReply,
};
use redis::AsyncCommands;
use uuid::Uuid;

use crate::models::task::TaskType;

const STREAM_PREFIX: &str = "docflow:tasks";

/// Consumer group shared by all worker processes.
pub const DEFAULT_GROUP: &str = "docflow-workers";

/// Stream carrying tasks of `task_type`.
pub fn stream_name(task_type: TaskType) -> String {
    format!("{STREAM_PREFIX}:{task_type}")
}

/// A claimed stream entry.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub stream: String,
    pub entry_id: String,
    pub fields: HashMap<String, String>,
    /// How many times this entry has been delivered, including this one.
    pub delivery_count: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum EntryError {
    #[error("entry is missing field {0:?}")]
    Missing(&'static str),

    #[error("entry field {field:?} is invalid: {detail}")]
    Invalid { field: &'static str, detail: String },
}

impl StreamEntry {
    pub fn task_id(&self) -> Result<Uuid, EntryError> {
        let raw = self.field("task_id")?;
        Uuid::parse_str(raw).map_err(|e| EntryError::Invalid {
            field: "task_id",
            detail: e.to_string(),
        })
    }

    pub fn task_type(&self) -> Result<TaskType, EntryError> {
        let raw = self.field("type")?;
        TaskType::from_str(raw).map_err(|_| EntryError::Invalid {
            field: "type",
            detail: format!("unknown task type {raw:?}"),
        })
    }

    pub fn payload(&self) -> Result<serde_json::Value, EntryError> {
        match self.fields.get("payload") {
            None => Ok(serde_json::Value::Object(Default::default())),
            Some(raw) => serde_json::from_str(raw).map_err(|e| EntryError::Invalid {
                field: "payload",
                detail: e.to_string(),
            }),
        }
    }

    fn field(&self, name: &'static str) -> Result<&str, EntryError> {
        self.fields
            .get(name)
            .map(String::as_str)
            .ok_or(EntryError::Missing(name))
    }
}

/// Fields written for a new task entry.
pub fn entry_fields(
    task_id: Uuid,
    task_type: TaskType,
    payload: &serde_json::Value,
) -> Vec<(String, String)> {
    vec![
        ("task_id".to_string(), task_id.to_string()),
        ("type".to_string(), task_type.to_string()),
        ("payload".to_string(), payload.to_string()),
    ]
}

#[async_trait]
pub trait TaskStream: Send + Sync {
    /// Create the consumer group (and stream) if missing. Idempotent.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), QueueError>;

    /// Append an entry, returning its stream-assigned id.
    async fn enqueue(&self, stream: &str, fields: &[(String, String)]) -> Result<String, QueueError>;

    /// Claim up to `count` never-delivered entries, waiting up to `block`.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, QueueError>;

    /// Take over entries pending longer than `min_idle` (crashed consumers).
    async fn reclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, QueueError>;

    /// Reset the idle timer on an entry this consumer still holds.
    async fn touch(&self, stream: &str, group: &str, consumer: &str, entry_id: &str)
        -> Result<(), QueueError>;

    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> Result<(), QueueError>;

    /// Number of claimed-but-unacknowledged entries in the group.
    async fn pending(&self, stream: &str, group: &str) -> Result<u64, QueueError>;

    async fn health_check(&self) -> Result<(), QueueError>;
}

/// Redis Streams implementation (XREADGROUP / XPENDING / XCLAIM / XACK).
pub struct RedisTaskStream {
    client: redis::Client,
}

impl RedisTaskStream {
    pub fn new(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self { client })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)
    }
}

fn to_entry(stream: &str, id: StreamId, delivery_count: u64) -> StreamEntry {
    let fields = id
        .map
        .iter()
        .filter_map(|(key, value)| {
            redis::from_redis_value::<String>(value)
                .ok()
                .map(|v| (key.clone(), v))
        })
        .collect();
    StreamEntry {
        stream: stream.to_string(),
        entry_id: id.id,
        fields,
        delivery_count,
    }
}

#[async_trait]
impl TaskStream for RedisTaskStream {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let created: redis::RedisResult<()> = conn.xgroup_create_mkstream(stream, group, "0").await;
        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(QueueError::Redis(e)),
        }
    }

    async fn enqueue(&self, stream: &str, fields: &[(String, String)]) -> Result<String, QueueError> {
        let mut conn = self.connection().await?;
        let id: String = conn.xadd(stream, "*", fields).await.map_err(QueueError::Redis)?;
        Ok(id)
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, QueueError> {
        // A blocking read ties up its connection, so it gets its own.
        let mut conn = self.connection().await?;
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block.as_millis() as usize);

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[stream], &[">"], &options)
            .await
            .map_err(QueueError::Redis)?;

        Ok(reply
            .map(|reply| {
                reply
                    .keys
                    .into_iter()
                    .flat_map(|key| key.ids)
                    .map(|id| to_entry(stream, id, 1))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn reclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, QueueError> {
        let mut conn = self.connection().await?;
        let min_idle_ms = min_idle.as_millis() as usize;

        // IDLE filters before COUNT applies (Redis 6.2+).
        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(QueueError::Redis)?;

        let deliveries: HashMap<String, u64> = pending
            .ids
            .into_iter()
            .map(|p| (p.id, p.times_delivered as u64))
            .collect();
        if deliveries.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<&str> = deliveries.keys().map(String::as_str).collect();
        // XCLAIM re-checks idle time, so racing consumers cannot both win.
        let claimed: StreamClaimReply = conn
            .xclaim(stream, group, consumer, min_idle_ms, &ids)
            .await
            .map_err(QueueError::Redis)?;

        Ok(claimed
            .ids
            .into_iter()
            .map(|id| {
                let previous = deliveries.get(&id.id).copied().unwrap_or(0);
                to_entry(stream, id, previous + 1)
            })
            .collect())
    }

    async fn touch(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        entry_id: &str,
    ) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("XCLAIM")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(0)
            .arg(entry_id)
            .arg("JUSTID")
            .query_async::<Vec<String>>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let _: i64 = conn
            .xack(stream, group, &[entry_id])
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    async fn pending(&self, stream: &str, group: &str) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let reply: StreamPendingReply = conn.xpending(stream, group).await.map_err(QueueError::Redis)?;
        Ok(reply.count() as u64)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Stream {stream:?} has no consumer group {group:?}")]
    NoGroup { stream: String, group: String },
}
