//! Process wiring shared by `serve`, `worker` and the integration tests.

use anyhow::{Context, Result};
use axum::Router;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::api::{AppState, create_router};
use crate::auth::AuthState;
use crate::config::AppConfig;
use crate::db::Database;
use crate::queue::{
    MemoryProcessedSet, MemoryRideQueue, ProcessedSet, RedisProcessedSet, RedisRideQueue,
    RideQueue, StorePollingQueue,
};
use crate::relay::{
    Dispatcher, EventBus, RedisEventBus, RelayBackendChoice, RelayListener, RelayMode,
    choose_backend,
};
use crate::rides::{RideRepository, RideService, RideStore};
use crate::worker::{AssignmentWorker, WorkerSettings, WorkerStats};
use crate::ws::SessionRegistry;

/// How long shutdown waits for background loops to stop.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// What this process is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Gateway and REST API, optionally with embedded workers.
    Server,
    /// Assignment loops only.
    Worker,
}

/// Stops background loops and closes every session. Cheap to clone into a
/// signal handler.
#[derive(Clone)]
pub struct ShutdownTrigger {
    cancel: CancellationToken,
    registry: Arc<SessionRegistry>,
}

impl ShutdownTrigger {
    pub fn fire(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        let closed = self.registry.close_all();
        info!("Shutdown: closed {} session(s)", closed);
    }
}

/// A fully wired RideNow process.
pub struct App {
    config: AppConfig,
    role: Role,
    state: AppState,
    store: Arc<dyn RideStore>,
    queue: Option<Arc<dyn RideQueue>>,
    worker_instances: usize,
    redis_queue: Option<Arc<RedisRideQueue>>,
    processed: Arc<dyn ProcessedSet>,
    bus: Option<Arc<dyn EventBus>>,
    worker_stats: Arc<WorkerStats>,
    cancel: CancellationToken,
    tasks: JoinSet<()>,
}

impl App {
    /// Pick the relay backend and build the shared components.
    pub async fn build(config: AppConfig, database: &Database, role: Role) -> Result<Self> {
        config
            .auth
            .validate()
            .context("Invalid auth configuration")?;
        let auth = AuthState::new(config.auth.clone());

        let registry = Arc::new(SessionRegistry::new());
        let store: Arc<dyn RideStore> = Arc::new(RideRepository::new(database.pool().clone()));

        let worker_instances = match role {
            Role::Worker => config.worker.instances.max(1),
            Role::Server if config.worker.embedded => config.worker.instances,
            Role::Server => 0,
        };

        let choice = choose_backend(&config.relay)
            .await
            .context("Redis relay is required but unreachable")?;

        let mut redis_queue = None;
        let mut bus = None;
        let (dispatcher, queue, processed): (
            Dispatcher,
            Option<Arc<dyn RideQueue>>,
            Arc<dyn ProcessedSet>,
        ) =
            match choice {
                RelayBackendChoice::Redis(client) => {
                    let event_bus: Arc<dyn EventBus> = Arc::new(
                        RedisEventBus::connect(client.clone(), config.relay.channel.clone())
                            .await
                            .context("connecting relay publisher")?,
                    );
                    let list = Arc::new(
                        RedisRideQueue::connect(client.clone(), config.queue.key.clone())
                            .await
                            .context("connecting ride queue")?,
                    );
                    let processed: Arc<dyn ProcessedSet> = Arc::new(
                        RedisProcessedSet::connect(&client, config.queue.processed_key.clone())
                            .await
                            .context("connecting processed set")?,
                    );
                    redis_queue = Some(list.clone());
                    bus = Some(event_bus.clone());
                    (
                        Dispatcher::distributed(registry.clone(), event_bus),
                        Some(list as Arc<dyn RideQueue>),
                        processed,
                    )
                }
                other => {
                    let dispatcher = match other {
                        RelayBackendChoice::Degraded => Dispatcher::degraded(registry.clone()),
                        _ => Dispatcher::local(registry.clone()),
                    };
                    let processed: Arc<dyn ProcessedSet> = Arc::new(MemoryProcessedSet::new());
                    let queue: Option<Arc<dyn RideQueue>> = match role {
                        Role::Server if worker_instances > 0 => {
                            Some(Arc::new(MemoryRideQueue::new()))
                        }
                        Role::Server => {
                            info!(
                                "No embedded workers: rides stay in the store until a \
                                 `ridenow worker` against the same database picks them up"
                            );
                            None
                        }
                        Role::Worker => Some(Arc::new(StorePollingQueue::new(
                            store.clone(),
                            processed.clone(),
                            config.queue.poll_interval(),
                        ))),
                    };
                    (dispatcher, queue, processed)
                }
            };

        if role == Role::Worker && dispatcher.mode() != RelayMode::Distributed {
            warn!(
                "Standalone worker without a shared channel: assignments are stored but \
                 notifications reach no sessions"
            );
        }

        let rides = RideService::new(store.clone(), queue.clone(), dispatcher);
        let worker_stats = Arc::new(WorkerStats::default());
        let mut state = AppState::new(auth, rides, registry);
        if role == Role::Worker || config.worker.embedded {
            state = state.with_worker_stats(worker_stats.clone());
        }

        Ok(Self {
            config,
            role,
            state,
            store,
            queue,
            worker_instances,
            redis_queue,
            processed,
            bus,
            worker_stats,
            cancel: CancellationToken::new(),
            tasks: JoinSet::new(),
        })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn relay_mode(&self) -> RelayMode {
        self.state.relay_mode()
    }

    pub fn worker_stats(&self) -> &Arc<WorkerStats> {
        &self.worker_stats
    }

    pub fn router(&self) -> Router {
        create_router(self.state.clone())
    }

    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        ShutdownTrigger {
            cancel: self.cancel.clone(),
            registry: self.state.registry.clone(),
        }
    }

    /// Spawn the relay listener and the assignment loops this role runs.
    pub fn start_background(&mut self) {
        if self.role == Role::Server
            && let Some(bus) = self.bus.clone()
        {
            let listener = RelayListener::new(
                bus,
                self.state.registry.clone(),
                self.config.relay.poll_timeout(),
                self.config.relay.reconnect_delay(),
            );
            self.tasks.spawn(listener.run(self.cancel.clone()));
        }

        self.spawn_workers();
    }

    fn spawn_workers(&mut self) {
        let instances = self.worker_instances;
        let settings = WorkerSettings::from(&self.config.worker);
        for index in 0..instances {
            let Some(queue) = self.consumer_queue() else {
                break;
            };
            let worker = AssignmentWorker::new(
                format!("worker-{index}"),
                self.store.clone(),
                queue,
                self.processed.clone(),
                self.state.dispatcher().clone(),
                settings.clone(),
            )
            .with_stats(self.worker_stats.clone());
            self.tasks.spawn(worker.run(self.cancel.clone()));
        }
        if instances > 0 {
            info!(
                "Started {} assignment worker(s) ({} relay)",
                instances,
                self.relay_mode()
            );
        }
    }

    /// Each blocking consumer gets its own queue connection.
    fn consumer_queue(&self) -> Option<Arc<dyn RideQueue>> {
        match &self.redis_queue {
            Some(list) => Some(Arc::new(list.consumer())),
            None => self.queue.clone(),
        }
    }

    /// Fire the shutdown trigger and wait for the background loops.
    pub async fn shutdown(mut self) {
        self.shutdown_trigger().fire();

        let drain = async {
            while let Some(result) = self.tasks.join_next().await {
                if let Err(e) = result {
                    warn!("Background task ended abnormally: {}", e);
                }
            }
        };
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await.is_err() {
            warn!("Background tasks did not stop in time, aborting");
            self.tasks.abort_all();
        }
    }
}
