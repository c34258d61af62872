//! Shared pub/sub channel between processes.

use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
use redis::{AsyncCommands, Client, aio::ConnectionManager};
use ridenow_protocol::DispatchEvent;

use super::RelayError;

/// Stream of events received from the shared channel.
///
/// An `Err` item is a single bad message; the stream ending means the
/// subscription broke.
pub type EventStream = BoxStream<'static, Result<DispatchEvent, RelayError>>;

/// Cross-process publish/subscribe transport for dispatch events.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event. Returns the number of subscribers that received it.
    async fn publish(&self, event: &DispatchEvent) -> Result<usize, RelayError>;

    /// Open a new subscription to the channel.
    async fn subscribe(&self) -> Result<EventStream, RelayError>;
}

/// Redis `PUBLISH` / `SUBSCRIBE` on one channel.
#[derive(Clone)]
pub struct RedisEventBus {
    client: Client,
    publisher: ConnectionManager,
    channel: String,
}

impl RedisEventBus {
    pub async fn connect(client: Client, channel: impl Into<String>) -> Result<Self, RelayError> {
        let publisher = client.get_connection_manager().await?;
        Ok(Self {
            client,
            publisher,
            channel: channel.into(),
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

fn decode(payload: redis::RedisResult<String>) -> Result<DispatchEvent, RelayError> {
    let payload = payload?;
    Ok(serde_json::from_str(&payload)?)
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn publish(&self, event: &DispatchEvent) -> Result<usize, RelayError> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self.publisher.clone();
        let receivers: usize = conn.publish(&self.channel, payload).await?;
        Ok(receivers)
    }

    async fn subscribe(&self) -> Result<EventStream, RelayError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.channel).await?;
        let stream = pubsub
            .into_on_message()
            .map(|msg| decode(msg.get_payload::<String>()));
        Ok(stream.boxed())
    }
}
