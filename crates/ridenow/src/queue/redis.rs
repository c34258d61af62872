//! Redis list queue and Redis set of processed rides.

use async_trait::async_trait;
use log::warn;
use redis::{AsyncCommands, Client, aio::ConnectionManager, aio::MultiplexedConnection};
use ridenow_protocol::RideId;
use std::time::Duration;
use tokio::sync::Mutex;

use super::{ProcessedSet, QueueError, RideQueue, decode_entry, encode_entry};

/// `RPUSH` / `BLPOP` on one list key.
///
/// `BLPOP` parks its connection, so pops go through a dedicated connection
/// instead of the shared manager. Give each consumer loop its own handle via
/// [`RedisRideQueue::consumer`].
pub struct RedisRideQueue {
    client: Client,
    conn: ConnectionManager,
    key: String,
    blocking: Mutex<Option<MultiplexedConnection>>,
}

impl RedisRideQueue {
    pub async fn connect(client: Client, key: impl Into<String>) -> Result<Self, QueueError> {
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            client,
            conn,
            key: key.into(),
            blocking: Mutex::new(None),
        })
    }

    /// Another handle on the same list with its own blocking connection.
    pub fn consumer(&self) -> Self {
        Self {
            client: self.client.clone(),
            conn: self.conn.clone(),
            key: self.key.clone(),
            blocking: Mutex::new(None),
        }
    }
}

#[async_trait]
impl RideQueue for RedisRideQueue {
    async fn enqueue(&self, ride_id: RideId) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.rpush(&self.key, encode_entry(ride_id)).await?;
        Ok(())
    }

    async fn blocking_pop(&self, timeout: Duration) -> Result<Option<RideId>, QueueError> {
        let mut guard = self.blocking.lock().await;
        let mut conn = match guard.take() {
            Some(conn) => conn,
            None => self.client.get_multiplexed_async_connection().await?,
        };

        // A failed connection is dropped here and replaced on the next call.
        let popped: Option<(String, String)> =
            conn.blpop(&self.key, timeout.as_secs_f64()).await?;
        *guard = Some(conn);

        match popped {
            None => Ok(None),
            Some((_, raw)) => match decode_entry(&raw) {
                Ok(ride_id) => Ok(Some(ride_id)),
                Err(err) => {
                    warn!("Discarding queue entry on {}: {}", self.key, err);
                    Ok(None)
                }
            },
        }
    }
}

/// `SISMEMBER` / `SADD` on one set key.
#[derive(Clone)]
pub struct RedisProcessedSet {
    conn: ConnectionManager,
    key: String,
}

impl RedisProcessedSet {
    pub async fn connect(client: &Client, key: impl Into<String>) -> Result<Self, QueueError> {
        Ok(Self {
            conn: client.get_connection_manager().await?,
            key: key.into(),
        })
    }
}

#[async_trait]
impl ProcessedSet for RedisProcessedSet {
    async fn contains(&self, ride_id: RideId) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        Ok(conn.sismember(&self.key, ride_id.get()).await?)
    }

    async fn insert(&self, ride_id: RideId) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.sadd(&self.key, ride_id.get()).await?;
        Ok(())
    }
}
