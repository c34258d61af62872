//! Ride state machine shared by the gateway and the REST API.

use ridenow_protocol::{DispatchEvent, ErrorCode, EventKind, RideId, RideStatus, UserId};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::models::{Ride, RideUpdate};
use super::store::RideStore;
use crate::queue::RideQueue;
use crate::relay::Dispatcher;

/// The user performing an action, with the role resolved from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: UserId,
    pub is_driver: bool,
}

impl Actor {
    pub fn new(user_id: UserId, is_driver: bool) -> Self {
        Self { user_id, is_driver }
    }
}

#[derive(Debug, Error)]
pub enum RideError {
    #[error("{0}")]
    Forbidden(&'static str),

    #[error("ride {0} not found")]
    NotFound(RideId),

    #[error("ride is {from}, cannot become {to}")]
    InvalidTransition { from: RideStatus, to: RideStatus },

    #[error("only the assigned driver can complete this ride")]
    NotRideDriver,

    #[error("{0}")]
    Validation(&'static str),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl RideError {
    /// Wire code carried in `error` events.
    pub fn code(&self) -> ErrorCode {
        match self {
            RideError::Forbidden(_) => ErrorCode::Forbidden,
            RideError::NotFound(_) => ErrorCode::NotFound,
            RideError::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            RideError::NotRideDriver => ErrorCode::NotRideDriver,
            RideError::Validation(_) => ErrorCode::InvalidPayload,
            RideError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Message safe to show the client.
    pub fn client_message(&self) -> String {
        match self {
            RideError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

/// A freshly created ride and whether it reached the work queue.
///
/// `queued` is false when this process has no queue; the ride then waits in
/// the store for a polling worker.
#[derive(Debug, Clone)]
pub struct RideCreated {
    pub ride: Ride,
    pub queued: bool,
}

/// Applies ride transitions and publishes the resulting notifications.
///
/// Persistence comes first and publication second; a failed publish is logged
/// and never rolls back the stored status.
#[derive(Clone)]
pub struct RideService {
    store: Arc<dyn RideStore>,
    queue: Option<Arc<dyn RideQueue>>,
    dispatcher: Dispatcher,
}

impl RideService {
    pub fn new(
        store: Arc<dyn RideStore>,
        queue: Option<Arc<dyn RideQueue>>,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            store,
            queue,
            dispatcher,
        }
    }

    pub fn store(&self) -> &Arc<dyn RideStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Resolve the role of an authenticated user. `None` if the user is unknown.
    pub async fn actor(&self, user_id: &UserId) -> Result<Option<Actor>, RideError> {
        Ok(self
            .store
            .get_user(user_id)
            .await?
            .map(|user| Actor::new(user.id, user.is_driver)))
    }

    /// Rider creates a ride: persist, enqueue, notify all drivers.
    pub async fn request_ride(
        &self,
        actor: &Actor,
        pickup: &str,
        dropoff: &str,
    ) -> Result<RideCreated, RideError> {
        if actor.is_driver {
            return Err(RideError::Forbidden("drivers cannot request rides"));
        }
        let pickup = pickup.trim();
        let dropoff = dropoff.trim();
        if pickup.is_empty() || dropoff.is_empty() {
            return Err(RideError::Validation("pickup and dropoff are required"));
        }

        let ride = self.store.create_ride(&actor.user_id, pickup, dropoff).await?;
        info!(ride_id = %ride.id, rider_id = %actor.user_id, "ride requested");

        let queued = match &self.queue {
            Some(queue) => match queue.enqueue(ride.id).await {
                Ok(()) => true,
                Err(err) => {
                    warn!(ride_id = %ride.id, error = %err, "failed to enqueue ride for assignment");
                    false
                }
            },
            None => {
                debug!(ride_id = %ride.id, "no queue in this process, ride left for a polling worker");
                false
            }
        };

        self.publish(DispatchEvent::to_all_drivers(
            EventKind::NewRide,
            ride.event_payload(),
        ))
        .await;

        Ok(RideCreated { ride, queued })
    }

    /// Driver takes a requested ride.
    pub async fn accept_ride(&self, actor: &Actor, ride_id: RideId) -> Result<Ride, RideError> {
        if !actor.is_driver {
            return Err(RideError::Forbidden("only drivers can accept rides"));
        }

        let ride = self.load(ride_id).await?;
        let ride = self
            .transition(ride, RideUpdate::assign(actor.user_id.clone()))
            .await?;
        info!(ride_id = %ride.id, driver_id = %actor.user_id, "ride accepted");

        self.publish(DispatchEvent::to_user(
            EventKind::RideAssigned,
            ride.rider_id.clone(),
            ride.event_payload(),
        ))
        .await;

        Ok(ride)
    }

    /// Assigned driver finishes a ride.
    pub async fn complete_ride(&self, actor: &Actor, ride_id: RideId) -> Result<Ride, RideError> {
        if !actor.is_driver {
            return Err(RideError::Forbidden("only drivers can complete rides"));
        }

        let ride = self.load(ride_id).await?;
        check_transition(ride.status, RideStatus::Completed)?;
        if ride.driver_id.as_ref() != Some(&actor.user_id) {
            return Err(RideError::NotRideDriver);
        }

        let ride = self
            .transition(ride, RideUpdate::status(RideStatus::Completed))
            .await?;
        info!(ride_id = %ride.id, driver_id = %actor.user_id, "ride completed");

        self.publish(DispatchEvent::to_user(
            EventKind::RideCompleted,
            ride.rider_id.clone(),
            ride.event_payload(),
        ))
        .await;

        Ok(ride)
    }

    /// Rider or assigned driver cancels a ride that has not finished.
    pub async fn cancel_ride(&self, actor: &Actor, ride_id: RideId) -> Result<Ride, RideError> {
        let ride = self.load(ride_id).await?;
        if !ride.involves(&actor.user_id) {
            return Err(RideError::Forbidden(
                "only the rider or the assigned driver can cancel this ride",
            ));
        }

        let ride = self
            .transition(ride, RideUpdate::status(RideStatus::Cancelled))
            .await?;
        info!(ride_id = %ride.id, user_id = %actor.user_id, "ride cancelled");

        self.publish(DispatchEvent::broadcast(
            EventKind::RideCancelled,
            ride.event_payload(),
        ))
        .await;

        Ok(ride)
    }

    /// A ride visible to `actor`: its rider or its driver.
    pub async fn ride_for(&self, actor: &Actor, ride_id: RideId) -> Result<Ride, RideError> {
        let ride = self.load(ride_id).await?;
        if !ride.involves(&actor.user_id) {
            return Err(RideError::Forbidden("not your ride"));
        }
        Ok(ride)
    }

    pub async fn rides_for(&self, actor: &Actor) -> Result<Vec<Ride>, RideError> {
        Ok(self.store.list_rides_for_user(&actor.user_id).await?)
    }

    async fn load(&self, ride_id: RideId) -> Result<Ride, RideError> {
        self.store
            .get_ride(ride_id)
            .await?
            .ok_or(RideError::NotFound(ride_id))
    }

    /// Conditionally move `ride` to `update.status` and return the stored result.
    async fn transition(&self, ride: Ride, update: RideUpdate) -> Result<Ride, RideError> {
        let to = update.status;
        check_transition(ride.status, to)?;

        let applied = self
            .store
            .conditional_update_ride(ride.id, ride.status, update)
            .await?;
        let current = self.load(ride.id).await?;

        if !applied {
            // Someone else moved the ride between our read and the update.
            return Err(RideError::InvalidTransition {
                from: current.status,
                to,
            });
        }
        Ok(current)
    }

    async fn publish(&self, event: DispatchEvent) {
        let kind = event.event_kind;
        if let Err(err) = self.dispatcher.publish(event).await {
            warn!(event = %kind, error = %err, "failed to publish ride event");
        }
    }
}

fn check_transition(from: RideStatus, to: RideStatus) -> Result<(), RideError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(RideError::InvalidTransition { from, to })
    }
}
