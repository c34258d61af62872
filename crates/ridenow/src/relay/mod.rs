//! Dispatch channel relay.
//!
//! Producers (gateway, REST handlers, workers) hand events to a [`Dispatcher`].
//! In local mode it delivers straight into this process's
//! [`SessionRegistry`]; in distributed mode it publishes to the shared
//! channel, and every process runs one [`RelayListener`] that delivers what
//! it receives to its own sessions.

mod bus;
mod listener;

pub use bus::{EventBus, EventStream, RedisEventBus};
pub use listener::RelayListener;

use log::{debug, info, warn};
use ridenow_protocol::DispatchEvent;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::ws::SessionRegistry;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("invalid event payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("timed out connecting to {0}")]
    ConnectTimeout(String),
}

/// How events travel between producers and sessions, fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    /// Configured for a single process.
    Local,
    /// Shared channel reachable; events cross process boundaries.
    Distributed,
    /// Shared channel configured but unreachable at startup; local delivery only.
    Degraded,
}

impl RelayMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RelayMode::Local => "local",
            RelayMode::Distributed => "distributed",
            RelayMode::Degraded => "degraded",
        }
    }
}

impl std::fmt::Display for RelayMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entry point for every event producer.
#[derive(Clone)]
pub struct Dispatcher {
    mode: RelayMode,
    registry: Arc<SessionRegistry>,
    bus: Option<Arc<dyn EventBus>>,
}

impl Dispatcher {
    pub fn local(registry: Arc<SessionRegistry>) -> Self {
        Self {
            mode: RelayMode::Local,
            registry,
            bus: None,
        }
    }

    pub fn degraded(registry: Arc<SessionRegistry>) -> Self {
        Self {
            mode: RelayMode::Degraded,
            registry,
            bus: None,
        }
    }

    pub fn distributed(registry: Arc<SessionRegistry>, bus: Arc<dyn EventBus>) -> Self {
        Self {
            mode: RelayMode::Distributed,
            registry,
            bus: Some(bus),
        }
    }

    pub fn mode(&self) -> RelayMode {
        self.mode
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> Option<&Arc<dyn EventBus>> {
        self.bus.as_ref()
    }

    /// Send an event toward its target sessions.
    ///
    /// Local delivery never fails; offline targets are dropped silently.
    pub async fn publish(&self, event: DispatchEvent) -> Result<(), RelayError> {
        match &self.bus {
            Some(bus) => {
                let receivers = bus.publish(&event).await?;
                debug!(
                    "Published {} to shared channel ({} subscriber(s))",
                    event.event_kind, receivers
                );
                Ok(())
            }
            None => {
                self.registry.deliver(&event);
                Ok(())
            }
        }
    }
}

/// Open a Redis client and check the server answers within `timeout`.
pub async fn probe_redis(url: &str, timeout: Duration) -> Result<redis::Client, RelayError> {
    let client = redis::Client::open(url)?;
    let mut conn = tokio::time::timeout(timeout, client.get_multiplexed_async_connection())
        .await
        .map_err(|_| RelayError::ConnectTimeout(url.to_string()))??;
    let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
    debug!("Redis at {} answered {}", url, pong);
    Ok(client)
}

/// Result of the startup backend decision.
pub enum RelayBackendChoice {
    Local,
    Redis(redis::Client),
    Degraded,
}

/// Decide the relay backend once at startup.
///
/// Fails when Redis is configured, unreachable and degraded mode is not allowed.
pub async fn choose_backend(
    config: &crate::config::RelayConfig,
) -> Result<RelayBackendChoice, RelayError> {
    use crate::config::RelayBackend;

    match config.backend {
        RelayBackend::Local => {
            info!("Relay backend: local (single process)");
            Ok(RelayBackendChoice::Local)
        }
        RelayBackend::Redis => match probe_redis(&config.redis_url, config.connect_timeout()).await {
            Ok(client) => {
                info!(
                    "Relay backend: redis at {} (channel {})",
                    config.redis_url, config.channel
                );
                Ok(RelayBackendChoice::Redis(client))
            }
            Err(err) if config.allow_degraded => {
                warn!(
                    "Redis at {} unreachable ({}); running in DEGRADED mode with local delivery only. \
                     Events from other processes will not reach sessions on this one.",
                    config.redis_url, err
                );
                Ok(RelayBackendChoice::Degraded)
            }
            Err(err) => Err(err),
        },
    }
}
