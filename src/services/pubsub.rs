//! Redis pub/sub channels: live progress fan-out and cross-process cancellation.
//!
//! Pub/sub is not durable. Subscribers that are offline miss messages, so
//! durable state always lives in the result store.

use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use redis::AsyncCommands;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::cancel::CancelRegistry;
use super::progress::ProgressPublisher;
use super::queue::QueueError;
use crate::models::progress::{progress_channel, ProgressMessage};

/// Channel carrying ids of tasks whose cancellation was requested.
pub const CANCEL_CHANNEL: &str = "docflow:cancel";

pub struct RedisProgressPublisher {
    conn: redis::aio::MultiplexedConnection,
}

impl RedisProgressPublisher {
    pub async fn connect(client: &redis::Client) -> Result<Self, QueueError> {
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl ProgressPublisher for RedisProgressPublisher {
    async fn publish(&self, message: &ProgressMessage) {
        let payload = match serde_json::to_string(message) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(task_id = %message.task_id, error = %e, "Failed to encode progress message");
                return;
            }
        };

        let mut conn = self.conn.clone();
        let published: redis::RedisResult<i64> =
            conn.publish(progress_channel(message.task_id), payload).await;
        if let Err(e) = published {
            tracing::warn!(task_id = %message.task_id, seq = message.seq, error = %e, "Failed to publish progress");
        }
    }
}

/// Live progress messages for one task. The subscription is active once this
/// returns, so nothing published afterwards is missed.
pub async fn subscribe_progress(
    client: &redis::Client,
    task_id: Uuid,
) -> Result<impl Stream<Item = ProgressMessage> + Send + 'static, QueueError> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(progress_channel(task_id)).await?;

    Ok(pubsub.into_on_message().filter_map(|msg| async move {
        let payload: String = msg.get_payload().ok()?;
        match serde_json::from_str::<ProgressMessage>(&payload) {
            Ok(message) => Some(message),
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed progress message");
                None
            }
        }
    }))
}

/// Ask whichever worker is running `task_id` to stop.
pub async fn publish_cancel(client: &redis::Client, task_id: Uuid) -> Result<(), QueueError> {
    let mut conn = client.get_multiplexed_async_connection().await?;
    let _: i64 = conn.publish(CANCEL_CHANNEL, task_id.to_string()).await?;
    Ok(())
}

/// Forward cancel requests to tasks running in this process until shutdown.
/// Reconnects if the subscription drops.
pub async fn listen_for_cancellations(
    client: redis::Client,
    registry: CancelRegistry,
    shutdown: CancellationToken,
) {
    const RECONNECT_DELAY: Duration = Duration::from_secs(1);

    while !shutdown.is_cancelled() {
        let mut pubsub = match client.get_async_pubsub().await {
            Ok(pubsub) => pubsub,
            Err(e) => {
                tracing::warn!(error = %e, "Cancel listener failed to connect, retrying");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => continue,
                }
            }
        };
        if let Err(e) = pubsub.subscribe(CANCEL_CHANNEL).await {
            tracing::warn!(error = %e, "Cancel listener failed to subscribe, retrying");
            tokio::time::sleep(RECONNECT_DELAY).await;
            continue;
        }
        tracing::info!(channel = CANCEL_CHANNEL, "Listening for cancel requests");

        let mut messages = pubsub.into_on_message();
        loop {
            let msg = tokio::select! {
                _ = shutdown.cancelled() => return,
                msg = messages.next() => msg,
            };
            let Some(msg) = msg else {
                tracing::warn!("Cancel subscription closed, reconnecting");
                break;
            };

            let task_id = msg
                .get_payload::<String>()
                .ok()
                .and_then(|raw| Uuid::parse_str(&raw).ok());
            match task_id {
                Some(task_id) if registry.cancel(task_id) => {
                    tracing::info!(task_id = %task_id, "Cancel signalled to running task");
                }
                Some(_) => {}
                None => tracing::warn!("Ignoring malformed cancel request"),
            }
        }
    }
}
