//! Execution context abstraction and the in-process variant.
//!
//! An execution context is one isolated unit of concurrent execution hosting
//! a task's handlers. The capability set is `{spawn, send, receive,
//! terminate}`; concrete variants (in-process task, external process, remote
//! worker) implement the same set. Contexts share no memory with the
//! controlling side; buffers cross the boundary only inside transfer lists.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{OffloadError, Result};
use crate::protocol::command::{CommandEnvelope, ReplyEnvelope};
use crate::protocol::dispatch::WorkerDispatcher;
use crate::task::TaskModule;

/// Handle to one spawned execution context.
#[async_trait]
pub trait ExecutionContext: Send + Sync {
    /// Deliver a command to the context.
    async fn send(&self, command: CommandEnvelope) -> Result<()>;

    /// Receive the next reply; `None` once the context has terminated.
    async fn recv(&self) -> Option<ReplyEnvelope>;

    /// Tear the context down. Idempotent; undelivered replies are lost.
    fn terminate(&self);
}

/// Spawns execution contexts for a task module.
pub trait ContextSpawner: Send + Sync {
    fn spawn(&self, module: &Arc<dyn TaskModule>) -> Result<Arc<dyn ExecutionContext>>;
}

/// In-process execution context backed by a tokio task running the
/// worker-side dispatcher.
pub struct LocalContext {
    commands: mpsc::Sender<CommandEnvelope>,
    replies: Mutex<mpsc::Receiver<ReplyEnvelope>>,
    worker: JoinHandle<()>,
}

#[async_trait]
impl ExecutionContext for LocalContext {
    async fn send(&self, command: CommandEnvelope) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| OffloadError::TransportFailure {
                message: "execution context is gone".to_string(),
            })
    }

    async fn recv(&self) -> Option<ReplyEnvelope> {
        self.replies.lock().await.recv().await
    }

    fn terminate(&self) {
        self.worker.abort();
    }
}

impl Drop for LocalContext {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

/// Spawner for in-process contexts; one tokio task per worker instance.
///
/// Must be used from within a tokio runtime.
#[derive(Debug, Clone)]
pub struct LocalSpawner {
    /// Command channel capacity per context.
    pub command_buffer: usize,

    /// Reply channel capacity per context.
    pub reply_buffer: usize,
}

impl Default for LocalSpawner {
    fn default() -> Self {
        Self {
            command_buffer: 16,
            reply_buffer: 64,
        }
    }
}

impl ContextSpawner for LocalSpawner {
    fn spawn(&self, module: &Arc<dyn TaskModule>) -> Result<Arc<dyn ExecutionContext>> {
        let (command_tx, command_rx) = mpsc::channel(self.command_buffer);
        let (reply_tx, reply_rx) = mpsc::channel(self.reply_buffer);

        let task = module.instantiate();
        let dispatcher = WorkerDispatcher::new(task, reply_tx);
        let worker = tokio::spawn(dispatcher.run(command_rx));
        debug!("spawned in-process execution context");

        Ok(Arc::new(LocalContext {
            commands: command_tx,
            replies: Mutex::new(reply_rx),
            worker,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::config::TaskConfig;
    use crate::protocol::command::{CorrelationId, WorkerReply};
    use crate::task::{TaskContext, WorkerTask};
    use crate::transfer::{StructuredResult, TransferList};

    struct EchoTask;

    #[async_trait]
    impl WorkerTask for EchoTask {
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
            Ok(StructuredResult::new().with_data("echo", params))
        }
    }

    fn echo_module() -> Arc<dyn TaskModule> {
        Arc::new(|| Box::new(EchoTask) as Box<dyn WorkerTask>)
    }

    #[tokio::test]
    async fn test_local_context_round_trip() {
        let context = LocalSpawner::default().spawn(&echo_module()).unwrap();

        use tokio_test::assert_ok;
        let init_id = CorrelationId::new();
        assert_ok!(
            context
                .send(CommandEnvelope::init(init_id, TaskConfig::default()))
                .await
        );
        let reply = context.recv().await.unwrap();
        assert_eq!(reply.correlation_id, init_id);
        assert!(matches!(reply.reply, WorkerReply::InitAck));

        let id = CorrelationId::new();
        context
            .send(CommandEnvelope::execute(id, serde_json::json!("ping"), Vec::new()))
            .await
            .unwrap();
        let reply = context.recv().await.unwrap();
        assert_eq!(reply.correlation_id, id);
        assert!(reply.is_terminal());
    }

    #[tokio::test]
    async fn test_terminated_context_stops_replying() {
        let context = LocalSpawner::default().spawn(&echo_module()).unwrap();
        context.terminate();

        assert!(context.recv().await.is_none());
    }
}
