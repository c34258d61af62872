//! Driver assignment: one ride id at a time, retried, deduplicated.

use ridenow_protocol::{DispatchEvent, EventKind, RideId, RideStatus, UserId};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::queue::{ProcessedSet, RideQueue};
use crate::relay::Dispatcher;
use crate::rides::{Ride, RideStore, RideUpdate};

/// Tunables for one worker loop.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub poll_timeout: Duration,
    pub error_backoff: Duration,
}

impl From<&WorkerConfig> for WorkerSettings {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            retry_delay: config.retry_delay(),
            poll_timeout: config.poll_timeout(),
            error_backoff: config.error_backoff(),
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

/// Counters shared by every loop in the process.
#[derive(Debug, Default)]
pub struct WorkerStats {
    processed: AtomicU64,
    assigned: AtomicU64,
    duplicates: AtomicU64,
    already_advanced: AtomicU64,
    not_found: AtomicU64,
    exhausted: AtomicU64,
}

/// Point-in-time copy of [`WorkerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStatsSnapshot {
    pub processed: u64,
    pub assigned: u64,
    pub duplicates: u64,
    pub already_advanced: u64,
    pub not_found: u64,
    pub exhausted: u64,
}

impl WorkerStats {
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            assigned: self.assigned.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            already_advanced: self.already_advanced.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
        }
    }

    fn record(&self, outcome: &AssignmentOutcome) {
        let counter = match outcome {
            AssignmentOutcome::Duplicate => &self.duplicates,
            AssignmentOutcome::Assigned { .. } => &self.assigned,
            AssignmentOutcome::AlreadyAdvanced { .. } => &self.already_advanced,
            AssignmentOutcome::NotFound => &self.not_found,
            AssignmentOutcome::Exhausted { .. } => &self.exhausted,
            AssignmentOutcome::Interrupted => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// What happened to one dequeued ride id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignmentOutcome {
    /// Already in the processed set; nothing done.
    Duplicate,
    /// This worker moved the ride to `assigned`.
    Assigned { driver_id: UserId },
    /// Someone else moved the ride first.
    AlreadyAdvanced { status: Option<RideStatus> },
    /// The ride does not exist.
    NotFound,
    /// No attempt succeeded; the ride stays `requested`.
    Exhausted { attempts: u32 },
    /// Shutdown arrived between attempts; the ride was not marked processed.
    Interrupted,
}

enum Attempt {
    Assigned { ride: Ride, driver_id: UserId },
    AlreadyAdvanced(Option<RideStatus>),
    NotFound,
    NoDriver,
}

/// Consumes the ride queue and assigns drivers.
///
/// Any number of these may run against the same queue, in one process or
/// many. The conditional status update decides which one wins a ride.
#[derive(Clone)]
pub struct AssignmentWorker {
    name: String,
    store: Arc<dyn RideStore>,
    queue: Arc<dyn RideQueue>,
    processed: Arc<dyn ProcessedSet>,
    dispatcher: Dispatcher,
    settings: WorkerSettings,
    stats: Arc<WorkerStats>,
}

impl AssignmentWorker {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn RideStore>,
        queue: Arc<dyn RideQueue>,
        processed: Arc<dyn ProcessedSet>,
        dispatcher: Dispatcher,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            queue,
            processed,
            dispatcher,
            settings,
            stats: Arc::new(WorkerStats::default()),
        }
    }

    /// Share counters with other workers.
    pub fn with_stats(mut self, stats: Arc<WorkerStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Replace the queue handle, e.g. with a dedicated consumer connection.
    pub fn with_queue(mut self, queue: Arc<dyn RideQueue>) -> Self {
        self.queue = queue;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> &Arc<WorkerStats> {
        &self.stats
    }

    /// Poll the queue until `cancel` fires.
    ///
    /// Cancellation is checked between pops only. The backend may already
    /// have removed an entry when a pop is in flight, so a pop always runs to
    /// completion; `poll_timeout` bounds how long shutdown waits for it.
    pub async fn run(self, cancel: CancellationToken) {
        info!(worker = %self.name, "assignment worker started");

        while !cancel.is_cancelled() {
            match self.queue.blocking_pop(self.settings.poll_timeout).await {
                Ok(None) => continue,
                Ok(Some(ride_id)) => {
                    if self.process(ride_id, &cancel).await == AssignmentOutcome::Interrupted {
                        self.requeue(ride_id).await;
                    }
                }
                Err(err) => {
                    warn!(
                        worker = %self.name,
                        error = %err,
                        backoff_ms = self.settings.error_backoff.as_millis() as u64,
                        "queue poll failed"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.settings.error_backoff) => {}
                    }
                }
            }
        }

        info!(worker = %self.name, "assignment worker stopped");
    }

    /// Handle one dequeued ride id to a terminal outcome.
    pub async fn process(&self, ride_id: RideId, cancel: &CancellationToken) -> AssignmentOutcome {
        self.stats.processed.fetch_add(1, Ordering::Relaxed);
        let outcome = self.process_inner(ride_id, cancel).await;
        self.stats.record(&outcome);
        outcome
    }

    async fn process_inner(&self, ride_id: RideId, cancel: &CancellationToken) -> AssignmentOutcome {
        match self.processed.contains(ride_id).await {
            Ok(true) => {
                debug!(worker = %self.name, %ride_id, "ride already processed, skipping");
                return AssignmentOutcome::Duplicate;
            }
            Ok(false) => {}
            Err(err) => {
                // The conditional update still prevents a double assignment.
                warn!(worker = %self.name, %ride_id, error = %err, "processed-set lookup failed");
            }
        }

        let max_attempts = self.settings.max_attempts;
        for attempt in 1..=max_attempts {
            match self.attempt(ride_id).await {
                Ok(Attempt::Assigned { ride, driver_id }) => {
                    info!(
                        worker = %self.name,
                        %ride_id,
                        driver_id = %driver_id,
                        attempt,
                        "driver assigned"
                    );
                    self.notify_assigned(&ride).await;
                    self.mark_processed(ride_id).await;
                    return AssignmentOutcome::Assigned { driver_id };
                }
                Ok(Attempt::AlreadyAdvanced(status)) => {
                    info!(worker = %self.name, %ride_id, ?status, "ride already advanced");
                    self.mark_processed(ride_id).await;
                    return AssignmentOutcome::AlreadyAdvanced { status };
                }
                Ok(Attempt::NotFound) => {
                    warn!(
                        target: "ridenow::telemetry",
                        worker = %self.name,
                        %ride_id,
                        "queued ride does not exist"
                    );
                    self.mark_processed(ride_id).await;
                    return AssignmentOutcome::NotFound;
                }
                Ok(Attempt::NoDriver) => {
                    info!(worker = %self.name, %ride_id, attempt, max_attempts, "no driver available");
                }
                Err(err) => {
                    warn!(
                        worker = %self.name,
                        %ride_id,
                        attempt,
                        max_attempts,
                        error = %err,
                        "assignment attempt failed"
                    );
                }
            }

            if attempt < max_attempts {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        warn!(worker = %self.name, %ride_id, attempt, "shutdown during assignment retry");
                        return AssignmentOutcome::Interrupted;
                    }
                    _ = tokio::time::sleep(self.settings.retry_delay) => {}
                }
            }
        }

        error!(
            target: "ridenow::telemetry",
            worker = %self.name,
            %ride_id,
            attempts = max_attempts,
            "ride assignment exhausted"
        );
        self.mark_processed(ride_id).await;
        AssignmentOutcome::Exhausted {
            attempts: max_attempts,
        }
    }

    async fn attempt(&self, ride_id: RideId) -> anyhow::Result<Attempt> {
        let Some(ride) = self.store.get_ride(ride_id).await? else {
            return Ok(Attempt::NotFound);
        };
        if ride.status != RideStatus::Requested {
            return Ok(Attempt::AlreadyAdvanced(Some(ride.status)));
        }

        let Some(driver_id) = self.store.find_available_driver().await? else {
            return Ok(Attempt::NoDriver);
        };

        let applied = self
            .store
            .conditional_update_ride(
                ride_id,
                RideStatus::Requested,
                RideUpdate::assign(driver_id.clone()),
            )
            .await?;

        let current = self.store.get_ride(ride_id).await?;
        if !applied {
            return Ok(Attempt::AlreadyAdvanced(current.map(|r| r.status)));
        }
        match current {
            Some(ride) => Ok(Attempt::Assigned { ride, driver_id }),
            None => Ok(Attempt::NotFound),
        }
    }

    async fn notify_assigned(&self, ride: &Ride) {
        let mut recipients = vec![ride.rider_id.clone()];
        recipients.extend(ride.driver_id.clone());

        for user_id in recipients {
            let event = DispatchEvent::to_user(EventKind::RideAssigned, user_id, ride.event_payload());
            if let Err(err) = self.dispatcher.publish(event).await {
                warn!(worker = %self.name, ride_id = %ride.id, error = %err, "failed to publish assignment");
            }
        }
    }

    /// Hand an interrupted ride back so another consumer can finish it.
    async fn requeue(&self, ride_id: RideId) {
        match self.queue.enqueue(ride_id).await {
            Ok(()) => info!(worker = %self.name, %ride_id, "interrupted ride requeued"),
            Err(err) => {
                error!(
                    target: "ridenow::telemetry",
                    worker = %self.name,
                    %ride_id,
                    error = %err,
                    "failed to requeue interrupted ride"
                );
            }
        }
    }

    async fn mark_processed(&self, ride_id: RideId) {
        if let Err(err) = self.processed.insert(ride_id).await {
            warn!(worker = %self.name, %ride_id, error = %err, "failed to record processed ride");
        }
    }
}
