//! The task-implementation contract.
//!
//! A task is a named unit of deferred work executable inside an isolated
//! execution context. Task code is registered at compile time as a
//! [`TaskModule`] and looked up by name in the manager's registry; each
//! worker instance gets a fresh task instance of its own.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::TaskConfig;
use crate::error::{OffloadError, Result};
use crate::protocol::command::{CorrelationId, ReplyEnvelope};
use crate::transfer::{StructuredResult, TransferList};

/// Handlers a task exposes to the worker-side dispatcher.
///
/// `init` runs exactly once per worker instance, before any execute;
/// `execute` runs once per dispatched request (repeatedly on reusable
/// instances, exactly once on one-shot instances).
#[async_trait]
pub trait WorkerTask: Send + Sync {
    /// Load configuration and prepare per-instance state.
    async fn init(&mut self, ctx: &TaskContext, config: &TaskConfig) -> Result<()>;

    /// Run the task once.
    ///
    /// Large binary outputs go into the returned [`StructuredResult`] as
    /// typed buffers; the dispatcher packages them for transfer. Incoming
    /// buffers arrive through `transfers`, already moved out of the
    /// controlling side.
    async fn execute(
        &mut self,
        ctx: &TaskContext,
        config: &TaskConfig,
        params: serde_json::Value,
        transfers: TransferList,
    ) -> Result<StructuredResult>;
}

/// Compile-time task source: produces a fresh task instance for each worker
/// context spawned from it.
pub trait TaskModule: Send + Sync {
    fn instantiate(&self) -> Box<dyn WorkerTask>;
}

impl<F> TaskModule for F
where
    F: Fn() -> Box<dyn WorkerTask> + Send + Sync,
{
    fn instantiate(&self) -> Box<dyn WorkerTask> {
        self()
    }
}

/// Worker-side handle handed to task handlers.
pub struct TaskContext {
    correlation_id: CorrelationId,
    outbound: mpsc::Sender<ReplyEnvelope>,
}

impl TaskContext {
    pub(crate) fn new(correlation_id: CorrelationId, outbound: mpsc::Sender<ReplyEnvelope>) -> Self {
        Self {
            correlation_id,
            outbound,
        }
    }

    /// Correlation id of the command being served.
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// Send one progress reply for the current request.
    pub async fn report_progress(&self, value: serde_json::Value) -> Result<()> {
        self.outbound
            .send(ReplyEnvelope::progress(self.correlation_id, value))
            .await
            .map_err(|_| OffloadError::TransportFailure {
                message: "progress reply channel closed".to_string(),
            })
    }
}

/// A registered task: unique name, compile-time module, pool configuration.
///
/// Immutable after registration unless explicitly re-registered with
/// [`RegistrationOptions::replace_existing`](crate::RegistrationOptions).
#[derive(Clone)]
pub struct TaskDefinition {
    name: String,
    module: Arc<dyn TaskModule>,
    config: TaskConfig,
}

impl TaskDefinition {
    pub fn new(name: impl Into<String>, module: Arc<dyn TaskModule>) -> Self {
        Self {
            name: name.into(),
            module,
            config: TaskConfig::default(),
        }
    }

    /// Attach a non-default configuration.
    pub fn with_config(mut self, config: TaskConfig) -> Self {
        self.config = config;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    pub(crate) fn module(&self) -> &Arc<dyn TaskModule> {
        &self.module
    }
}

impl std::fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
