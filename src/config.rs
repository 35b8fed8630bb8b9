//! Task configuration.

use serde::{Deserialize, Serialize};

use crate::error::{OffloadError, Result};

/// Per-task configuration attached to a [`TaskDefinition`](crate::TaskDefinition).
///
/// Carried inside the `init` command, so everything here must serialize.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Upper bound on concurrently live worker instances for the task.
    pub max_workers: usize,

    /// Terminate an instance after it has served exactly one execute.
    pub oneshot_workers: bool,

    /// How many dead instances the pool may replace after transport failures
    /// before giving up on the task.
    pub respawn_limit: u32,

    /// Opaque settings handed to the task's `init` handler.
    pub init_settings: serde_json::Value,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            oneshot_workers: false,
            respawn_limit: 3,
            init_settings: serde_json::Value::Null,
        }
    }
}

impl TaskConfig {
    /// Build a configuration from `OFFLOAD_*` environment variables, falling
    /// back to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(max_workers) = std::env::var("OFFLOAD_MAX_WORKERS") {
            config.max_workers = max_workers.parse().map_err(|e| OffloadError::InvalidConfig {
                message: format!("invalid max_workers: {e}"),
            })?;
        }

        if let Ok(respawn_limit) = std::env::var("OFFLOAD_RESPAWN_LIMIT") {
            config.respawn_limit =
                respawn_limit.parse().map_err(|e| OffloadError::InvalidConfig {
                    message: format!("invalid respawn_limit: {e}"),
                })?;
        }

        if let Ok(oneshot) = std::env::var("OFFLOAD_ONESHOT_WORKERS") {
            config.oneshot_workers = oneshot.parse().map_err(|e| OffloadError::InvalidConfig {
                message: format!("invalid oneshot_workers: {e}"),
            })?;
        }

        Ok(config)
    }

    /// Set the pool size limit.
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    /// Mark instances as one-shot.
    pub fn with_oneshot_workers(mut self, oneshot: bool) -> Self {
        self.oneshot_workers = oneshot;
        self
    }

    /// Set the transport-failure respawn budget.
    pub fn with_respawn_limit(mut self, respawn_limit: u32) -> Self {
        self.respawn_limit = respawn_limit;
        self
    }

    /// Attach settings for the task's `init` handler.
    pub fn with_init_settings(mut self, settings: serde_json::Value) -> Self {
        self.init_settings = settings;
        self
    }
}
