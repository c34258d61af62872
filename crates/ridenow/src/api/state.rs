//! Application state shared across handlers.

use std::sync::Arc;

use crate::auth::AuthState;
use crate::relay::{Dispatcher, RelayMode};
use crate::rides::RideService;
use crate::worker::WorkerStats;
use crate::ws::SessionRegistry;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// Token validation for the gateway and the REST routes.
    pub auth: AuthState,
    /// Ride state machine.
    pub rides: RideService,
    /// Sessions connected to this instance.
    pub registry: Arc<SessionRegistry>,
    /// Counters of the embedded assignment workers, if any run here.
    pub worker_stats: Option<Arc<WorkerStats>>,
}

impl AppState {
    pub fn new(auth: AuthState, rides: RideService, registry: Arc<SessionRegistry>) -> Self {
        Self {
            auth,
            rides,
            registry,
            worker_stats: None,
        }
    }

    pub fn with_worker_stats(mut self, stats: Arc<WorkerStats>) -> Self {
        self.worker_stats = Some(stats);
        self
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        self.rides.dispatcher()
    }

    pub fn relay_mode(&self) -> RelayMode {
        self.dispatcher().mode()
    }
}
