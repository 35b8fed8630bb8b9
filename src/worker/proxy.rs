//! Worker proxy: one execution context and its request lifecycle.
//!
//! State machine: `spawning → initializing → ready ⇄ busy → (ready |
//! terminated)`, with an error transition from any non-terminal state to
//! `terminated` on transport failure. At most one request is in flight per
//! instance; no pipelining.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::config::TaskConfig;
use crate::error::{OffloadError, Result};
use crate::protocol::command::{CommandEnvelope, CorrelationId, WorkerReply};
use crate::protocol::dispatch::{PendingRequest, ProgressFn, ReplyRouter, RouteOutcome};
use crate::task::TaskModule;
use crate::transfer::{StructuredResult, TransferList};
use crate::worker::context::{ContextSpawner, ExecutionContext};

/// Pool-local worker identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(pub u64);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker_{}", self.0)
    }
}

/// Lifecycle state of a worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Spawning,
    Initializing,
    Ready,
    Busy,
    Terminated,
}

/// One dispatchable request: correlation id, input, transfers, and the
/// completion side resolved exactly once.
pub(crate) struct ExecutionRequest {
    pub correlation_id: CorrelationId,
    pub params: serde_json::Value,
    pub transfers: TransferList,
    pub progress: Option<ProgressFn>,
    pub completion: oneshot::Sender<Result<StructuredResult>>,
    pub submitted_at: DateTime<Utc>,
}

/// Outcome of driving one request on an instance, for pool policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestOutcome {
    /// Terminal reply arrived; the instance can serve again.
    Finished,
    /// The context died mid-request; the instance must be discarded.
    ContextLost,
}

/// Wraps one execution context and correlates its outstanding request to
/// responses. Owned exclusively by the pool of its task.
pub struct WorkerProxy {
    id: WorkerId,
    context: Arc<dyn ExecutionContext>,
    state: RwLock<WorkerState>,
}

impl WorkerProxy {
    /// Spawn the underlying execution context for `module`.
    pub(crate) fn spawn(
        id: WorkerId,
        spawner: &dyn ContextSpawner,
        module: &Arc<dyn TaskModule>,
    ) -> Result<Self> {
        let context = spawner.spawn(module)?;
        Ok(Self {
            id,
            context,
            state: RwLock::new(WorkerState::Spawning),
        })
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        *self.state.read()
    }

    pub(crate) fn set_state(&self, state: WorkerState) {
        *self.state.write() = state;
    }

    /// Send `init` and wait for its acknowledgment.
    ///
    /// On success the caller marks the instance ready; on failure the
    /// instance is terminated and must not be reused.
    pub(crate) async fn initialize(&self, config: &TaskConfig) -> Result<()> {
        self.set_state(WorkerState::Initializing);
        let init_id = CorrelationId::new();

        if let Err(error) = self
            .context
            .send(CommandEnvelope::init(init_id, config.clone()))
            .await
        {
            self.terminate();
            return Err(error);
        }

        loop {
            match self.context.recv().await {
                None => {
                    self.terminate();
                    return Err(OffloadError::TransportFailure {
                        message: format!("{} terminated during initialization", self.id),
                    });
                }
                Some(envelope) if envelope.correlation_id != init_id => {
                    warn!(
                        worker = %self.id,
                        correlation_id = %envelope.correlation_id,
                        "unexpected correlation id during initialization"
                    );
                }
                Some(envelope) => match envelope.reply {
                    WorkerReply::InitAck => {
                        debug!(worker = %self.id, "initialized");
                        return Ok(());
                    }
                    WorkerReply::Error { error } => {
                        self.terminate();
                        return Err(OffloadError::InitializationFailure {
                            message: error.message,
                        });
                    }
                    WorkerReply::Progress { .. } | WorkerReply::Completion { .. } => {
                        warn!(worker = %self.id, "unexpected reply kind during initialization");
                    }
                },
            }
        }
    }

    /// Dispatch `request` and pump replies until its terminal reply.
    ///
    /// The completion handle is resolved or rejected in here; the returned
    /// outcome only tells the pool what to do with the instance.
    pub(crate) async fn run(&self, request: ExecutionRequest) -> RequestOutcome {
        let id = request.correlation_id;
        let mut router = ReplyRouter::new();
        let pending = PendingRequest {
            progress: request.progress,
            completion: request.completion,
        };
        if let Err(error) = router.track(id, pending) {
            warn!(worker = %self.id, correlation_id = %id, %error, "failed to track request");
            return RequestOutcome::Finished;
        }

        let envelope = CommandEnvelope::execute(id, request.params, request.transfers);
        if let Err(error) = self.context.send(envelope).await {
            router.reject_all(&error);
            return RequestOutcome::ContextLost;
        }

        loop {
            match self.context.recv().await {
                None => {
                    router.reject_all(&OffloadError::TransportFailure {
                        message: format!("{} terminated while busy", self.id),
                    });
                    return RequestOutcome::ContextLost;
                }
                Some(reply) => match router.route(reply) {
                    RouteOutcome::Progress | RouteOutcome::Unmatched => continue,
                    RouteOutcome::Completed | RouteOutcome::Failed => {
                        return RequestOutcome::Finished
                    }
                },
            }
        }
    }

    /// Tear down the underlying context. Idempotent.
    pub(crate) fn terminate(&self) {
        self.set_state(WorkerState::Terminated);
        self.context.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::task::{TaskContext, WorkerTask};
    use crate::worker::context::LocalSpawner;

    struct SquareTask;

    #[async_trait]
    impl WorkerTask for SquareTask {
        async fn init(&mut self, _ctx: &TaskContext, _config: &TaskConfig) -> Result<()> {
            Ok(())
        }

        async fn execute(
            &mut self,
            ctx: &TaskContext,
            _config: &TaskConfig,
            params: serde_json::Value,
            _transfers: TransferList,
        ) -> Result<StructuredResult> {
            ctx.report_progress(serde_json::json!(0.5)).await?;
            let value = params["value"].as_i64().unwrap_or(0);
            Ok(StructuredResult::new().with_data("result", serde_json::json!(value * value)))
        }
    }

    struct FailingInitTask;

    #[async_trait]
    impl WorkerTask for FailingInitTask {
        async fn init(&mut self, _ctx: &TaskContext, _config: &TaskConfig) -> Result<()> {
            Err(OffloadError::InitializationFailure {
                message: "missing lookup table".to_string(),
            })
        }

        async fn execute(
            &mut self,
            _ctx: &TaskContext,
            _config: &TaskConfig,
            _params: serde_json::Value,
            _transfers: TransferList,
        ) -> Result<StructuredResult> {
            Ok(StructuredResult::new())
        }
    }

    fn spawn_proxy(module: Arc<dyn TaskModule>) -> WorkerProxy {
        WorkerProxy::spawn(WorkerId(0), &LocalSpawner::default(), &module).unwrap()
    }

    #[tokio::test]
    async fn test_proxy_initialize_and_run() {
        let proxy = spawn_proxy(Arc::new(|| Box::new(SquareTask) as Box<dyn WorkerTask>));
        assert_eq!(proxy.state(), WorkerState::Spawning);

        proxy.initialize(&TaskConfig::default()).await.unwrap();

        let (completion_tx, completion_rx) = oneshot::channel();
        let request = ExecutionRequest {
            correlation_id: CorrelationId::new(),
            params: serde_json::json!({ "value": 6 }),
            transfers: Vec::new(),
            progress: None,
            completion: completion_tx,
            submitted_at: Utc::now(),
        };

        let outcome = proxy.run(request).await;
        assert_eq!(outcome, RequestOutcome::Finished);

        let result = completion_rx.await.unwrap().unwrap();
        assert_eq!(result.data("result").unwrap(), 36);
    }

    #[tokio::test]
    async fn test_proxy_init_failure_terminates() {
        let proxy = spawn_proxy(Arc::new(|| Box::new(FailingInitTask) as Box<dyn WorkerTask>));

        let error = proxy.initialize(&TaskConfig::default()).await.unwrap_err();
        assert!(matches!(error, OffloadError::InitializationFailure { .. }));
        assert_eq!(proxy.state(), WorkerState::Terminated);
    }

    #[tokio::test]
    async fn test_proxy_termination_while_busy_rejects_request() {
        let proxy = spawn_proxy(Arc::new(|| Box::new(SquareTask) as Box<dyn WorkerTask>));
        proxy.initialize(&TaskConfig::default()).await.unwrap();
        proxy.terminate();

        let (completion_tx, completion_rx) = oneshot::channel();
        let request = ExecutionRequest {
            correlation_id: CorrelationId::new(),
            params: serde_json::json!({ "value": 2 }),
            transfers: Vec::new(),
            progress: None,
            completion: completion_tx,
            submitted_at: Utc::now(),
        };

        let outcome = proxy.run(request).await;
        assert_eq!(outcome, RequestOutcome::ContextLost);
        assert!(matches!(
            completion_rx.await.unwrap(),
            Err(OffloadError::TransportFailure { .. })
        ));
    }
}
