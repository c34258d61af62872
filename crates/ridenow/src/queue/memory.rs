//! In-process queue for single-process deployments and tests.

use async_trait::async_trait;
use ridenow_protocol::RideId;
use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

use super::{ProcessedSet, QueueError, RideQueue};

#[derive(Debug, Default)]
pub struct MemoryRideQueue {
    items: Mutex<VecDeque<RideId>>,
    notify: Notify,
}

impl MemoryRideQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.lock().await.is_empty()
    }
}

#[async_trait]
impl RideQueue for MemoryRideQueue {
    async fn enqueue(&self, ride_id: RideId) -> Result<(), QueueError> {
        self.items.lock().await.push_back(ride_id);
        self.notify.notify_one();
        Ok(())
    }

    async fn blocking_pop(&self, timeout: Duration) -> Result<Option<RideId>, QueueError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if let Some(ride_id) = self.items.lock().await.pop_front() {
                return Ok(Some(ride_id));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryProcessedSet {
    ids: Mutex<HashSet<RideId>>,
}

impl MemoryProcessedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.ids.lock().await.len()
    }
}

#[async_trait]
impl ProcessedSet for MemoryProcessedSet {
    async fn contains(&self, ride_id: RideId) -> Result<bool, QueueError> {
        Ok(self.ids.lock().await.contains(&ride_id))
    }

    async fn insert(&self, ride_id: RideId) -> Result<(), QueueError> {
        self.ids.lock().await.insert(ride_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = MemoryRideQueue::new();
        for id in [3, 1, 2] {
            queue.enqueue(RideId::new(id)).await.unwrap();
        }
        for id in [3, 1, 2] {
            assert_eq!(
                queue.blocking_pop(Duration::from_millis(10)).await.unwrap(),
                Some(RideId::new(id))
            );
        }
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_pop_times_out_when_empty() {
        let queue = MemoryRideQueue::new();
        let started = tokio::time::Instant::now();
        assert_eq!(
            queue.blocking_pop(Duration::from_millis(50)).await.unwrap(),
            None
        );
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_pop_wakes_on_enqueue() {
        let queue = Arc::new(MemoryRideQueue::new());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.blocking_pop(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(RideId::new(8)).await.unwrap();

        assert_eq!(consumer.await.unwrap().unwrap(), Some(RideId::new(8)));
    }

    #[tokio::test]
    async fn test_processed_set() {
        let set = MemoryProcessedSet::new();
        assert!(!set.contains(RideId::new(1)).await.unwrap());
        set.insert(RideId::new(1)).await.unwrap();
        set.insert(RideId::new(1)).await.unwrap();
        assert!(set.contains(RideId::new(1)).await.unwrap());
        assert_eq!(set.len().await, 1);
    }
}
