//! Queue fed by scanning the store for unassigned rides.
//!
//! Lets a standalone worker run without Redis against the same database as
//! the gateway. Scans page forward by ride id, so rides that were exhausted
//! and stay `requested` never hide newer ones.

use async_trait::async_trait;
use log::debug;
use ridenow_protocol::RideId;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::{ProcessedSet, QueueError, RideQueue};
use crate::rides::RideStore;

const SCAN_LIMIT: i64 = 10;

pub struct StorePollingQueue {
    store: Arc<dyn RideStore>,
    processed: Arc<dyn ProcessedSet>,
    poll_interval: Duration,
    pending: Mutex<VecDeque<RideId>>,
    handed_out: Mutex<HashSet<RideId>>,
    cursor: Mutex<Option<RideId>>,
}

impl StorePollingQueue {
    pub fn new(
        store: Arc<dyn RideStore>,
        processed: Arc<dyn ProcessedSet>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            processed,
            poll_interval,
            pending: Mutex::new(VecDeque::new()),
            handed_out: Mutex::new(HashSet::new()),
            cursor: Mutex::new(None),
        }
    }

    /// Read pages past the cursor until one yields a new ride or the store
    /// runs out.
    async fn scan(&self) -> Result<usize, QueueError> {
        let mut cursor = self.cursor.lock().await;
        let mut found = 0;
        loop {
            let rides = self.store.list_pending_rides(*cursor, SCAN_LIMIT).await?;
            let page_len = rides.len();
            for ride in rides {
                *cursor = Some(ride.id);
                if self.handed_out.lock().await.contains(&ride.id)
                    || self.processed.contains(ride.id).await?
                {
                    continue;
                }
                self.handed_out.lock().await.insert(ride.id);
                self.pending.lock().await.push_back(ride.id);
                found += 1;
            }
            if found > 0 || (page_len as i64) < SCAN_LIMIT {
                break;
            }
        }
        if found > 0 {
            debug!("Found {} unassigned ride(s) in store", found);
        }
        Ok(found)
    }
}

#[async_trait]
impl RideQueue for StorePollingQueue {
    async fn enqueue(&self, ride_id: RideId) -> Result<(), QueueError> {
        self.handed_out.lock().await.insert(ride_id);
        self.pending.lock().await.push_back(ride_id);
        Ok(())
    }

    async fn blocking_pop(&self, timeout: Duration) -> Result<Option<RideId>, QueueError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(ride_id) = self.pending.lock().await.pop_front() {
                return Ok(Some(ride_id));
            }
            if self.scan().await? > 0 {
                continue;
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::queue::MemoryProcessedSet;
    use crate::rides::{NewUser, RideRepository};
    use ridenow_protocol::UserId;

    async fn repo() -> RideRepository {
        let db = Database::in_memory().await.unwrap();
        let repo = RideRepository::new(db.pool().clone());
        repo.upsert_user(&NewUser {
            id: UserId::from("1"),
            name: "rider".to_string(),
            email: None,
            is_driver: false,
        })
        .await
        .unwrap();
        repo
    }

    #[tokio::test]
    async fn test_yields_each_pending_ride_once() {
        let repo = repo().await;
        let first = repo.create_ride(&UserId::from("1"), "A", "B").await.unwrap();
        let second = repo.create_ride(&UserId::from("1"), "C", "D").await.unwrap();

        let processed = Arc::new(MemoryProcessedSet::new());
        processed.insert(second.id).await.unwrap();

        let queue = StorePollingQueue::new(
            Arc::new(repo),
            processed,
            Duration::from_millis(10),
        );

        assert_eq!(
            queue.blocking_pop(Duration::from_millis(50)).await.unwrap(),
            Some(first.id)
        );
        assert_eq!(
            queue.blocking_pop(Duration::from_millis(50)).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_exhausted_rides_do_not_hide_newer_ones() {
        let repo = repo().await;
        let processed = Arc::new(MemoryProcessedSet::new());
        for _ in 0..(SCAN_LIMIT * 2 + 3) {
            let stuck = repo.create_ride(&UserId::from("1"), "A", "B").await.unwrap();
            processed.insert(stuck.id).await.unwrap();
        }
        let fresh = repo.create_ride(&UserId::from("1"), "C", "D").await.unwrap();

        let queue = StorePollingQueue::new(Arc::new(repo), processed, Duration::from_millis(10));

        assert_eq!(
            queue.blocking_pop(Duration::from_millis(200)).await.unwrap(),
            Some(fresh.id)
        );
        assert_eq!(
            queue.blocking_pop(Duration::from_millis(50)).await.unwrap(),
            None
        );
    }
}
