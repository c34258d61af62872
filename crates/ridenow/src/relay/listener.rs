//! The per-process subscriber loop.

use futures::StreamExt;
use log::{debug, info, trace, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::EventBus;
use crate::ws::SessionRegistry;

/// Receives events from the shared channel and delivers them locally.
///
/// Exactly one of these runs per process in distributed mode. Events are
/// delivered one at a time in arrival order.
pub struct RelayListener {
    bus: Arc<dyn EventBus>,
    registry: Arc<SessionRegistry>,
    poll_timeout: Duration,
    reconnect_delay: Duration,
}

impl RelayListener {
    pub fn new(
        bus: Arc<dyn EventBus>,
        registry: Arc<SessionRegistry>,
        poll_timeout: Duration,
        reconnect_delay: Duration,
    ) -> Self {
        Self {
            bus,
            registry,
            poll_timeout,
            reconnect_delay,
        }
    }

    /// Run until `cancel` fires, resubscribing whenever the subscription breaks.
    pub async fn run(self, cancel: CancellationToken) {
        info!("Relay listener started");

        while !cancel.is_cancelled() {
            let subscription = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.bus.subscribe() => result,
            };

            match subscription {
                Ok(mut stream) => {
                    info!("Relay subscribed to shared channel");
                    loop {
                        let next = tokio::select! {
                            _ = cancel.cancelled() => {
                                info!("Relay listener stopped");
                                return;
                            }
                            next = tokio::time::timeout(self.poll_timeout, stream.next()) => next,
                        };

                        match next {
                            Err(_) => trace!("Relay poll timeout, no events"),
                            Ok(Some(Ok(event))) => {
                                let report = self.registry.deliver(&event);
                                debug!(
                                    "Relayed {} ({:?}): {} delivered, {} dropped",
                                    event.event_kind,
                                    event.target,
                                    report.delivered,
                                    report.dropped
                                );
                            }
                            Ok(Some(Err(err))) => {
                                warn!("Skipping unparsable relay message: {}", err);
                            }
                            Ok(None) => {
                                warn!("Relay subscription ended, resubscribing");
                                break;
                            }
                        }
                    }
                }
                Err(err) => warn!(
                    "Relay subscribe failed: {}; retrying in {:?}",
                    err, self.reconnect_delay
                ),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }

        info!("Relay listener stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{EventStream, RelayError};
    use crate::ws::SessionHandle;
    use async_trait::async_trait;
    use ridenow_protocol::{DispatchEvent, EventKind, UserId};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    /// In-process bus; each subscription yields the next prepared batch, then ends.
    struct BatchBus {
        batches: Mutex<Vec<Vec<Result<DispatchEvent, RelayError>>>>,
        subscribe_calls: AtomicUsize,
    }

    #[async_trait]
    impl EventBus for BatchBus {
        async fn publish(&self, _event: &DispatchEvent) -> Result<usize, RelayError> {
            Ok(0)
        }

        async fn subscribe(&self) -> Result<EventStream, RelayError> {
            self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
            match self.batches.lock().await.pop() {
                Some(batch) => Ok(futures::stream::iter(batch).boxed()),
                None => Ok(futures::stream::pending().boxed()),
            }
        }
    }

    fn event(user: &str, n: i64) -> DispatchEvent {
        DispatchEvent::to_user(EventKind::RideAssigned, UserId::from(user), json!({ "n": n }))
    }

    #[tokio::test]
    async fn test_listener_delivers_in_order_and_skips_bad_messages() {
        let registry = Arc::new(SessionRegistry::new());
        let (handle, mut rx) = SessionHandle::new(UserId::from("1"), false);
        registry.register(handle);

        let batch = vec![
            Ok(event("1", 1)),
            Err(RelayError::Decode(
                serde_json::from_str::<DispatchEvent>("nope").unwrap_err(),
            )),
            Ok(event("1", 2)),
            Ok(event("2", 3)),
        ];
        let bus = Arc::new(BatchBus {
            batches: Mutex::new(vec![batch]),
            subscribe_calls: AtomicUsize::new(0),
        });
        let listener = RelayListener::new(
            bus.clone(),
            registry,
            Duration::from_millis(50),
            Duration::from_millis(10),
        );

        let cancel = CancellationToken::new();
        let task = tokio::spawn(listener.run(cancel.clone()));

        assert_eq!(rx.recv().await.unwrap().payload["n"], 1);
        assert_eq!(rx.recv().await.unwrap().payload["n"], 2);

        // The first stream ends after its items; the listener resubscribes.
        tokio::time::timeout(Duration::from_secs(2), async {
            while bus.subscribe_calls.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }
}
