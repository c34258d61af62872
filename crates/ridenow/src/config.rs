//! Typed application configuration.
//!
//! Loaded by the binary from defaults, the TOML config file and
//! `RIDENOW__SECTION__KEY` environment variables, in that order.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::auth::AuthConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub relay: RelayConfig,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            auth: AuthConfig::default(),
            relay: RelayConfig::default(),
            queue: QueueConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level when no verbosity flag is given.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file. Defaults to `<data_dir>/ridenow.db` when unset.
    pub path: Option<String>,
}

/// Which shared channel carries events between processes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayBackend {
    /// Single process; events go straight into the local registry.
    #[default]
    Local,
    /// Redis pub/sub channel plus Redis list queue.
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub backend: RelayBackend,
    pub redis_url: String,
    /// Pub/sub channel carrying `DispatchEvent` JSON.
    pub channel: String,
    /// Upper bound on one subscriber poll, so cancellation is observed promptly.
    pub poll_timeout_ms: u64,
    /// Delay before resubscribing after the subscription breaks.
    pub reconnect_delay_ms: u64,
    /// Startup probe timeout for the Redis connection.
    pub connect_timeout_ms: u64,
    /// Fall back to local delivery when Redis is unreachable at startup.
    pub allow_degraded: bool,
}

impl RelayConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms.max(1))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            backend: RelayBackend::Local,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            channel: "ride_updates".to_string(),
            poll_timeout_ms: 1000,
            reconnect_delay_ms: 2000,
            connect_timeout_ms: 2000,
            allow_degraded: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Redis list holding pending ride ids.
    pub key: String,
    /// Redis set of ride ids whose assignment attempt finished.
    pub processed_key: String,
    /// Interval between database scans when the worker polls the store.
    pub poll_interval_ms: u64,
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            key: "ride_queue".to_string(),
            processed_key: "ride_queue:processed".to_string(),
            poll_interval_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Run assignment loops inside `serve`.
    pub embedded: bool,
    /// Concurrent assignment loops per process.
    pub instances: usize,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub poll_timeout_secs: u64,
    /// Pause after a queue backend error before polling again.
    pub error_backoff_ms: u64,
}

impl WorkerConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs.max(1))
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            embedded: true,
            instances: 1,
            max_attempts: 5,
            retry_delay_ms: 5000,
            poll_timeout_secs: 5,
            error_backoff_ms: 5000,
        }
    }
}
