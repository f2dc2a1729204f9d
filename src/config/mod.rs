//! Server configuration.
//!
//! Every field has a default, so an empty JSON object (or no file at all)
//! yields a working server on port 1316.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::server::ServerError;

/// Environment variable naming a JSON config file for [`ServerConfig::load`].
pub const CONFIG_ENV: &str = "RTTPD_CONFIG";

/// Runtime configuration for [`Server`](crate::server::Server).
///
/// # Examples
///
/// ```
/// use rttpd::config::ServerConfig;
///
/// let config = ServerConfig::from_json_str(r#"{ "port": 8080, "trigger_mode": 1 }"#).unwrap();
/// assert_eq!(config.port, 8080);
/// assert!(!config.trigger().listen_edge);
/// assert!(config.trigger().conn_edge);
/// assert_eq!(config.worker_threads, 6);
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Listen port. `0` asks the OS for an ephemeral port.
    pub port: u16,
    /// 0 = LT/LT, 1 = LT/ET, 2 = ET/LT, anything else ET/ET (listener/connections).
    pub trigger_mode: u8,
    /// Idle timeout in milliseconds; zero or negative disables eviction.
    pub timeout_ms: i64,
    /// Close with `SO_LINGER` set to one second.
    pub linger: bool,
    pub worker_threads: usize,
    pub max_connections: usize,
    /// Tasks that may wait for a worker; zero means `max_connections`. A
    /// connection whose task does not fit is closed.
    pub task_queue: usize,
    /// Resource root, relative to the working directory unless absolute.
    pub resource_dir: PathBuf,
    /// Credential backends; zero answers every login/register with 503.
    pub credential_pool_size: usize,
    pub credential_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 1316,
            trigger_mode: 3,
            timeout_ms: 60_000,
            linger: false,
            worker_threads: 6,
            max_connections: 65_536,
            task_queue: 0,
            resource_dir: PathBuf::from("resources"),
            credential_pool_size: 12,
            credential_timeout_ms: 2_000,
        }
    }
}

impl ServerConfig {
    /// Parses and validates a JSON document; missing fields take defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ServerError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ServerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ServerError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&text)
    }

    /// Reads the file named by `RTTPD_CONFIG`, or returns the defaults when
    /// the variable is unset.
    pub fn load() -> Result<Self, ServerError> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_json_file(path),
            None => Ok(Self::default()),
        }
    }

    /// Rejects privileged ports and zero-sized worker or connection limits.
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.port != 0 && self.port < 1024 {
            return Err(ServerError::InvalidPort(self.port));
        }
        if self.worker_threads == 0 {
            return Err(ServerError::Config("worker_threads must be positive".into()));
        }
        if self.max_connections == 0 {
            return Err(ServerError::Config("max_connections must be positive".into()));
        }
        Ok(())
    }

    /// Decodes `trigger_mode`.
    pub fn trigger(&self) -> TriggerMode {
        TriggerMode::from_code(self.trigger_mode)
    }

    /// Capacity of the worker pool's task queue.
    pub fn task_queue_capacity(&self) -> usize {
        if self.task_queue == 0 {
            self.max_connections
        } else {
            self.task_queue
        }
    }

    /// `None` when idle eviction is disabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        u64::try_from(self.timeout_ms)
            .ok()
            .filter(|&ms| ms > 0)
            .map(Duration::from_millis)
    }

    /// How long a form check waits for a credential backend.
    pub fn credential_timeout(&self) -> Duration {
        Duration::from_millis(self.credential_timeout_ms)
    }
}

/// Edge- versus level-triggered handling for the listener and for
/// connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerMode {
    pub listen_edge: bool,
    pub conn_edge: bool,
}

impl TriggerMode {
    /// Decodes a trigger-mode number; anything above 2 is edge/edge.
    pub fn from_code(code: u8) -> Self {
        let (listen_edge, conn_edge) = match code {
            0 => (false, false),
            1 => (false, true),
            2 => (true, false),
            _ => (true, true),
        };
        Self {
            listen_edge,
            conn_edge,
        }
    }
}
