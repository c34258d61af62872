//! Ride work queue and the set of rides whose assignment already finished.
//!
//! Delivery is at-least-once: a ride id may be popped more than once, and
//! consumers deduplicate through [`ProcessedSet`].

mod memory;
mod polling;
mod redis;

pub use self::memory::{MemoryProcessedSet, MemoryRideQueue};
pub use self::polling::StorePollingQueue;
pub use self::redis::{RedisProcessedSet, RedisRideQueue};

use async_trait::async_trait;
use ridenow_protocol::RideId;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("malformed queue entry: {0}")]
    Malformed(String),

    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

/// FIFO of ride ids waiting for a driver.
#[async_trait]
pub trait RideQueue: Send + Sync {
    async fn enqueue(&self, ride_id: RideId) -> Result<(), QueueError>;

    /// Wait up to `timeout` for the next ride id. `None` on timeout.
    async fn blocking_pop(&self, timeout: Duration) -> Result<Option<RideId>, QueueError>;
}

/// Ride ids whose assignment attempt completed, successfully or not.
#[async_trait]
pub trait ProcessedSet: Send + Sync {
    async fn contains(&self, ride_id: RideId) -> Result<bool, QueueError>;

    async fn insert(&self, ride_id: RideId) -> Result<(), QueueError>;
}

/// Encode a queue entry as `{"ride_id": N}`.
pub(crate) fn encode_entry(ride_id: RideId) -> String {
    serde_json::json!({ "ride_id": ride_id }).to_string()
}

/// Decode a queue entry; bare integers are accepted too.
pub(crate) fn decode_entry(raw: &str) -> Result<RideId, QueueError> {
    if let Ok(id) = raw.parse::<RideId>() {
        return Ok(id);
    }

    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|_| QueueError::Malformed(raw.to_string()))?;
    let ride_id = value.get("ride_id").ok_or_else(|| QueueError::Malformed(raw.to_string()))?;

    ride_id
        .as_i64()
        .or_else(|| ride_id.as_str().and_then(|s| s.trim().parse().ok()))
        .map(RideId::new)
        .ok_or_else(|| QueueError::Malformed(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_encoding() {
        assert_eq!(encode_entry(RideId::new(12)), r#"{"ride_id":12}"#);
        assert_eq!(decode_entry(r#"{"ride_id":12}"#).unwrap(), RideId::new(12));
        assert_eq!(decode_entry(r#"{"ride_id":"7"}"#).unwrap(), RideId::new(7));
        assert_eq!(decode_entry("31").unwrap(), RideId::new(31));
    }

    #[test]
    fn test_malformed_entries() {
        for raw in ["", "{}", r#"{"ride_id":null}"#, "abc", r#"{"ride_id":"x"}"#] {
            assert!(
                matches!(decode_entry(raw), Err(QueueError::Malformed(_))),
                "{raw:?} should be malformed"
            );
        }
    }
}
