//! Command dispatch on both sides of the context boundary.
//!
//! The worker side demultiplexes incoming commands to the task's registered
//! `init` and `execute` handlers; the controlling side demultiplexes replies
//! by correlation id to the matching request's progress callback or
//! completion handle.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::config::TaskConfig;
use crate::error::{OffloadError, Result};
use crate::protocol::command::{
    CommandEnvelope, CorrelationId, ReplyEnvelope, WireError, WorkerCommand, WorkerReply,
};
use crate::task::{TaskContext, WorkerTask};
use crate::transfer::StructuredResult;

/// Callback invoked for each progress reply of a request, zero or more times
/// before the request resolves.
pub type ProgressFn = Arc<dyn Fn(serde_json::Value) + Send + Sync>;

/// Worker-side command loop: demultiplexes incoming commands to the task's
/// `init` and `execute` handlers.
///
/// Protocol-state violations (`execute` before `init`, a second `init`) are
/// answered with an error reply, never silently dropped.
pub struct WorkerDispatcher {
    task: Box<dyn WorkerTask>,
    config: Option<TaskConfig>,
    outbound: mpsc::Sender<ReplyEnvelope>,
}

impl WorkerDispatcher {
    pub fn new(task: Box<dyn WorkerTask>, outbound: mpsc::Sender<ReplyEnvelope>) -> Self {
        Self {
            task,
            config: None,
            outbound,
        }
    }

    /// Run until the command channel closes or the controlling side goes away.
    pub async fn run(mut self, mut commands: mpsc::Receiver<CommandEnvelope>) {
        while let Some(envelope) = commands.recv().await {
            if self.dispatch(envelope).await.is_err() {
                break;
            }
        }
        debug!("worker command loop finished");
    }

    async fn dispatch(&mut self, envelope: CommandEnvelope) -> std::result::Result<(), ()> {
        let id = envelope.correlation_id;
        let reply = match envelope.command {
            WorkerCommand::Init { config } => {
                if self.config.is_some() {
                    ReplyEnvelope::error(id, WireError::protocol("init received twice"))
                } else {
                    let ctx = TaskContext::new(id, self.outbound.clone());
                    match self.task.init(&ctx, &config).await {
                        Ok(()) => {
                            self.config = Some(config);
                            ReplyEnvelope::init_ack(id)
                        }
                        Err(e) => ReplyEnvelope::error(id, WireError::initialization(e.to_string())),
                    }
                }
            }
            WorkerCommand::Execute { params, transfers } => match &self.config {
                None => ReplyEnvelope::error(id, WireError::protocol("execute received before init")),
                Some(config) => {
                    let ctx = TaskContext::new(id, self.outbound.clone());
                    match self.task.execute(&ctx, config, params, transfers).await {
                        Ok(result) => {
                            let (data, transfers) = result.package();
                            ReplyEnvelope::completion(id, data, transfers)
                        }
                        Err(e) => ReplyEnvelope::error(id, WireError::execution(e.to_string())),
                    }
                }
            },
        };
        // A closed reply channel means the controlling side is gone.
        self.outbound.send(reply).await.map_err(|_| ())
    }
}

/// A request registered with the reply router, awaiting its terminal reply.
pub struct PendingRequest {
    pub progress: Option<ProgressFn>,
    pub completion: oneshot::Sender<Result<StructuredResult>>,
}

/// What [`ReplyRouter::route`] did with a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Progress delivered; the request is still in flight.
    Progress,
    /// Terminal reply resolved the request.
    Completed,
    /// Terminal reply rejected the request.
    Failed,
    /// No pending request matched the correlation id.
    Unmatched,
}

/// Controlling-side dispatcher: demultiplexes worker replies by correlation
/// id to the matching request's progress callback or completion handle.
#[derive(Default)]
pub struct ReplyRouter {
    pending: HashMap<CorrelationId, PendingRequest>,
}

impl ReplyRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request under its correlation id.
    ///
    /// An id is reused only after its request has resolved; tracking a
    /// duplicate is rejected.
    pub fn track(&mut self, id: CorrelationId, pending: PendingRequest) -> Result<()> {
        if self.pending.contains_key(&id) {
            return Err(OffloadError::TransportFailure {
                message: format!("correlation id {id} already in flight"),
            });
        }
        self.pending.insert(id, pending);
        Ok(())
    }

    /// Dispatch one reply. Terminal replies remove the pending entry and
    /// resolve or reject its completion handle; completion payloads are
    /// reconstructed (move semantics) before resolution.
    pub fn route(&mut self, envelope: ReplyEnvelope) -> RouteOutcome {
        let id = envelope.correlation_id;
        match envelope.reply {
            WorkerReply::InitAck => {
                warn!(correlation_id = %id, "init acknowledgment outside initialization");
                RouteOutcome::Unmatched
            }
            WorkerReply::Progress { value } => match self.pending.get(&id) {
                Some(pending) => {
                    if let Some(callback) = &pending.progress {
                        callback(value);
                    }
                    RouteOutcome::Progress
                }
                None => {
                    warn!(correlation_id = %id, "progress reply without pending request");
                    RouteOutcome::Unmatched
                }
            },
            WorkerReply::Completion { data, transfers } => {
                let Some(pending) = self.pending.remove(&id) else {
                    warn!(correlation_id = %id, "completion reply without pending request");
                    return RouteOutcome::Unmatched;
                };
                let mut transfers = transfers;
                match data.reconstruct(&mut transfers, false) {
                    Ok(result) => {
                        let _ = pending.completion.send(Ok(result));
                        RouteOutcome::Completed
                    }
                    Err(error) => {
                        let _ = pending.completion.send(Err(error));
                        RouteOutcome::Failed
                    }
                }
            }
            WorkerReply::Error { error } => {
                let Some(pending) = self.pending.remove(&id) else {
                    warn!(correlation_id = %id, "error reply without pending request");
                    return RouteOutcome::Unmatched;
                };
                let _ = pending.completion.send(Err(error.into_error()));
                RouteOutcome::Failed
            }
        }
    }

    /// Reject every pending request, draining the router.
    pub fn reject_all(&mut self, error: &OffloadError) {
        for (_, pending) in self.pending.drain() {
            let _ = pending.completion.send(Err(error.clone()));
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use crate::transfer::TransferList;

    /// Doubles `params["value"]`; fails on demand.
    struct DoublerTask;

    #[async_trait]
    impl WorkerTask for DoublerTask {
        async fn init(&mut self, _ctx: &TaskContext, _config: &TaskConfig) -> Result<()> {
            Ok(())
        }

        async fn execute(
            &mut self,
            _ctx: &TaskContext,
            _config: &TaskConfig,
            params: serde_json::Value,
            _transfers: TransferList,
        ) -> Result<StructuredResult> {
            let value = params["value"].as_i64().ok_or(OffloadError::ExecutionFailure {
                message: "missing value".to_string(),
            })?;
            Ok(StructuredResult::new().with_data("result", serde_json::json!(value * 2)))
        }
    }

    fn boxed_doubler() -> Box<dyn WorkerTask> {
        Box::new(DoublerTask)
    }

    #[tokio::test]
    async fn test_dispatcher_rejects_execute_before_init() {
        let (command_tx, command_rx) = mpsc::channel(4);
        let (reply_tx, mut reply_rx) = mpsc::channel(4);
        tokio::spawn(WorkerDispatcher::new(boxed_doubler(), reply_tx).run(command_rx));

        let id = CorrelationId::new();
        command_tx
            .send(CommandEnvelope::execute(id, serde_json::json!({}), Vec::new()))
            .await
            .unwrap();

        let reply = reply_rx.recv().await.unwrap();
        assert_eq!(reply.correlation_id, id);
        match reply.reply {
            WorkerReply::Error { error } => {
                assert_eq!(error.error_type.as_deref(), Some("protocol"))
            }
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dispatcher_rejects_second_init() {
        let (command_tx, command_rx) = mpsc::channel(4);
        let (reply_tx, mut reply_rx) = mpsc::channel(4);
        tokio::spawn(WorkerDispatcher::new(boxed_doubler(), reply_tx).run(command_rx));

        command_tx
            .send(CommandEnvelope::init(CorrelationId::new(), TaskConfig::default()))
            .await
            .unwrap();
        assert!(matches!(
            reply_rx.recv().await.unwrap().reply,
            WorkerReply::InitAck
        ));

        command_tx
            .send(CommandEnvelope::init(CorrelationId::new(), TaskConfig::default()))
            .await
            .unwrap();
        assert!(matches!(
            reply_rx.recv().await.unwrap().reply,
            WorkerReply::Error { .. }
        ));
    }

    #[tokio::test]
    async fn test_dispatcher_executes_after_init() {
        let (command_tx, command_rx) = mpsc::channel(4);
        let (reply_tx, mut reply_rx) = mpsc::channel(4);
        tokio::spawn(WorkerDispatcher::new(boxed_doubler(), reply_tx).run(command_rx));

        command_tx
            .send(CommandEnvelope::init(CorrelationId::new(), TaskConfig::default()))
            .await
            .unwrap();
        reply_rx.recv().await.unwrap();

        let id = CorrelationId::new();
        command_tx
            .send(CommandEnvelope::execute(
                id,
                serde_json::json!({ "value": 21 }),
                Vec::new(),
            ))
            .await
            .unwrap();

        let reply = reply_rx.recv().await.unwrap();
        match reply.reply {
            WorkerReply::Completion { data, mut transfers } => {
                let result = data.reconstruct(&mut transfers, false).unwrap();
                assert_eq!(result.data("result").unwrap(), 42);
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_router_routes_progress_then_terminal() {
        let mut router = ReplyRouter::new();
        let id = CorrelationId::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_by_callback = Arc::clone(&seen);
        let (completion_tx, completion_rx) = oneshot::channel();

        router
            .track(
                id,
                PendingRequest {
                    progress: Some(Arc::new(move |value| {
                        seen_by_callback.lock().push(value);
                    })),
                    completion: completion_tx,
                },
            )
            .unwrap();

        let outcome = router.route(ReplyEnvelope::progress(id, serde_json::json!(0.5)));
        assert_eq!(outcome, RouteOutcome::Progress);
        assert_eq!(router.len(), 1);

        let (data, transfers) = StructuredResult::new()
            .with_data("done", serde_json::json!(true))
            .package();
        let outcome = router.route(ReplyEnvelope::completion(id, data, transfers));
        assert_eq!(outcome, RouteOutcome::Completed);
        assert!(router.is_empty());

        assert_eq!(seen.lock().len(), 1);
        let result = completion_rx.await.unwrap().unwrap();
        assert_eq!(result.data("done").unwrap(), &serde_json::json!(true));
    }

    #[tokio::test]
    async fn test_router_rejects_duplicate_correlation_id() {
        let mut router = ReplyRouter::new();
        let id = CorrelationId::new();

        let (first_tx, _first_rx) = oneshot::channel();
        router
            .track(id, PendingRequest { progress: None, completion: first_tx })
            .unwrap();

        let (second_tx, _second_rx) = oneshot::channel();
        let result = router.track(id, PendingRequest { progress: None, completion: second_tx });
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_router_ignores_unmatched_replies() {
        let mut router = ReplyRouter::new();
        let outcome = router.route(ReplyEnvelope::progress(
            CorrelationId::new(),
            serde_json::json!(1),
        ));
        assert_eq!(outcome, RouteOutcome::Unmatched);
    }

    #[tokio::test]
    async fn test_router_reject_all_drains() {
        let mut router = ReplyRouter::new();
        let id = CorrelationId::new();
        let (completion_tx, completion_rx) = oneshot::channel();
        router
            .track(id, PendingRequest { progress: None, completion: completion_tx })
            .unwrap();

        router.reject_all(&OffloadError::TransportFailure {
            message: "context lost".to_string(),
        });

        assert!(router.is_empty());
        assert!(matches!(
            completion_rx.await.unwrap(),
            Err(OffloadError::TransportFailure { .. })
        ));
    }
}
