//! Per-task worker pool: bounded instance set, FIFO pending queue, dispatch
//! fairness, and bounded respawn after transport failure.
//!
//! Requests are always queued first and dispatched oldest-first, so dispatch
//! order matches submission order; completion order is only guaranteed to
//! match at pool size 1. Instances are spawned lazily while the queue is
//! non-empty and the pool is below its size limit.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use chrono::Utc;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::error::{OffloadError, Result};
use crate::protocol::command::CorrelationId;
use crate::protocol::dispatch::ProgressFn;
use crate::task::TaskDefinition;
use crate::transfer::{StructuredResult, TransferList};
use crate::worker::context::ContextSpawner;
use crate::worker::proxy::{
    ExecutionRequest, RequestOutcome, WorkerId, WorkerProxy, WorkerState,
};

/// Await side of a scheduled request.
///
/// Resolution happens asynchronously on message arrival; the scheduling call
/// never blocks on worker execution. No internal timeout exists; compose
/// `tokio::time::timeout` around [`wait`](Self::wait) when one is needed.
pub struct CompletionHandle {
    correlation_id: CorrelationId,
    receiver: oneshot::Receiver<Result<StructuredResult>>,
}

impl CompletionHandle {
    /// Correlation id of the scheduled request, usable with
    /// [`TaskManager::cancel`](crate::TaskManager::cancel).
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// Wait for the terminal outcome of the request.
    pub async fn wait(self) -> Result<StructuredResult> {
        match self.receiver.await {
            Ok(outcome) => outcome,
            // The completion side vanished without resolving: pool torn down.
            Err(_) => Err(OffloadError::TransportFailure {
                message: "completion handle abandoned".to_string(),
            }),
        }
    }
}

/// Outcome of a cancellation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Removed from the queue; the handle rejected with
    /// [`OffloadError::Cancelled`].
    Dequeued,
    /// The serving instance was terminated; the handle rejects with
    /// [`OffloadError::TransportFailure`].
    Terminating,
    /// No queued or in-flight request carries the id.
    NotFound,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub task_name: String,
    pub total_workers: usize,
    pub idle_workers: usize,
    pub busy_workers: usize,
    pub initializing_workers: usize,
    pub queued_requests: usize,
    pub respawns_remaining: u32,
    pub disposed: bool,
}

struct WorkerSlot {
    id: WorkerId,
    /// Absent while the context is still being spawned on its init task.
    proxy: Option<Arc<WorkerProxy>>,
    /// The request this instance currently serves, at most one.
    serving: Option<CorrelationId>,
}

struct PoolInner {
    workers: Vec<WorkerSlot>,
    queue: VecDeque<ExecutionRequest>,
    next_worker_id: u64,
    respawns_remaining: u32,
    /// Set once the respawn budget is spent; no further instances are spawned.
    poisoned: bool,
    disposed: bool,
}

/// Bounded, named collection of worker instances for one task definition.
///
/// Owns the pending-request queue and the dispatch fairness policy. Instances
/// belong to exactly one pool for their entire lifetime.
pub struct WorkerPool {
    definition: TaskDefinition,
    spawner: Arc<dyn ContextSpawner>,
    inner: Mutex<PoolInner>,
    /// Self-handle for the detached init and drive tasks.
    self_ref: Weak<WorkerPool>,
}

impl WorkerPool {
    pub(crate) fn new(definition: TaskDefinition, spawner: Arc<dyn ContextSpawner>) -> Arc<Self> {
        let respawns_remaining = definition.config().respawn_limit;
        Arc::new_cyclic(|self_ref| Self {
            definition,
            spawner,
            inner: Mutex::new(PoolInner {
                workers: Vec::new(),
                queue: VecDeque::new(),
                next_worker_id: 0,
                respawns_remaining,
                poisoned: false,
                disposed: false,
            }),
            self_ref: self_ref.clone(),
        })
    }

    pub fn task_name(&self) -> &str {
        self.definition.name()
    }

    /// Queue one execution request and run a dispatch cycle.
    pub(crate) async fn schedule(
        &self,
        params: serde_json::Value,
        transfers: TransferList,
        progress: Option<ProgressFn>,
    ) -> CompletionHandle {
        let correlation_id = CorrelationId::new();
        let (completion_tx, completion_rx) = oneshot::channel();
        let request = ExecutionRequest {
            correlation_id,
            params,
            transfers,
            progress,
            completion: completion_tx,
            submitted_at: Utc::now(),
        };

        {
            let mut inner = self.inner.lock().await;
            if inner.disposed {
                let _ = request.completion.send(Err(OffloadError::TransportFailure {
                    message: format!("task '{}' is disposed", self.task_name()),
                }));
                return CompletionHandle {
                    correlation_id,
                    receiver: completion_rx,
                };
            }
            if inner.poisoned && inner.workers.is_empty() {
                let _ = request.completion.send(Err(OffloadError::TransportFailure {
                    message: format!(
                        "task '{}' exhausted its respawn budget",
                        self.task_name()
                    ),
                }));
                return CompletionHandle {
                    correlation_id,
                    receiver: completion_rx,
                };
            }
            inner.queue.push_back(request);
            debug!(
                task = self.task_name(),
                correlation_id = %correlation_id,
                queued = inner.queue.len(),
                "request queued"
            );
        }

        self.dispatch_cycle().await;
        CompletionHandle {
            correlation_id,
            receiver: completion_rx,
        }
    }

    /// One pass of the dispatch policy: hand the oldest queued requests to
    /// ready instances, then lazily spawn while the queue is still non-empty
    /// and the instance count is below the size limit.
    fn dispatch_cycle(&self) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        // Returns a boxed, type-erased `Send` future rather than being an
        // `async fn`: `dispatch_cycle` spawns `spawn_and_initialize`, which
        // awaits `dispatch_cycle` again, and the concrete opaque future type
        // would otherwise form an auto-trait inference cycle that leaves the
        // spawned future non-`Send`.
        Box::pin(async move {
        // Teardown in progress if the upgrade fails; nothing left to drive.
        let Some(pool) = self.self_ref.upgrade() else { return };

        let mut assignments: Vec<(Arc<WorkerProxy>, ExecutionRequest)> = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            if inner.disposed {
                return;
            }
            let inner = &mut *inner;

            for slot in inner.workers.iter_mut() {
                if inner.queue.is_empty() {
                    break;
                }
                let Some(proxy) = &slot.proxy else { continue };
                if proxy.state() != WorkerState::Ready {
                    continue;
                }
                let Some(request) = inner.queue.pop_front() else { break };
                proxy.set_state(WorkerState::Busy);
                slot.serving = Some(request.correlation_id);
                debug!(
                    task = self.definition.name(),
                    worker = %slot.id,
                    correlation_id = %request.correlation_id,
                    waited_ms = (Utc::now() - request.submitted_at).num_milliseconds(),
                    "request dispatched"
                );
                assignments.push((Arc::clone(proxy), request));
            }

            if !inner.poisoned {
                let limit = self.definition.config().max_workers;
                let headroom = limit.saturating_sub(inner.workers.len());
                let spawns = inner.queue.len().min(headroom);
                for _ in 0..spawns {
                    let id = WorkerId(inner.next_worker_id);
                    inner.next_worker_id += 1;
                    inner.workers.push(WorkerSlot {
                        id,
                        proxy: None,
                        serving: None,
                    });
                    let pool = Arc::clone(&pool);
                    tokio::spawn(async move { pool.spawn_and_initialize(id).await });
                }
                if spawns > 0 {
                    debug!(
                        task = self.definition.name(),
                        count = spawns,
                        "spawning worker instances"
                    );
                }
            }
        }

        for (proxy, request) in assignments {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                let worker_id = proxy.id();
                let outcome = proxy.run(request).await;
                pool.after_run(worker_id, outcome).await;
            });
        }
        })
    }

    /// Spawn and initialize one instance, then join the dispatch cycle.
    async fn spawn_and_initialize(&self, id: WorkerId) {
        let proxy = match WorkerProxy::spawn(id, self.spawner.as_ref(), self.definition.module()) {
            Ok(proxy) => Arc::new(proxy),
            Err(error) => {
                warn!(task = self.task_name(), worker = %id, %error, "failed to spawn execution context");
                self.handle_worker_loss(id, error).await;
                return;
            }
        };

        {
            let mut inner = self.inner.lock().await;
            if inner.disposed {
                proxy.terminate();
                return;
            }
            match inner.workers.iter_mut().find(|slot| slot.id == id) {
                Some(slot) => slot.proxy = Some(Arc::clone(&proxy)),
                None => {
                    // Slot removed while spawning.
                    proxy.terminate();
                    return;
                }
            }
        }

        match proxy.initialize(self.definition.config()).await {
            Ok(()) => {
                proxy.set_state(WorkerState::Ready);
                debug!(task = self.task_name(), worker = %id, "worker ready");
                self.dispatch_cycle().await;
            }
            Err(error) => {
                warn!(task = self.task_name(), worker = %id, %error, "worker failed to initialize");
                self.handle_worker_loss(id, error).await;
            }
        }
    }

    /// Instance bookkeeping after a request finished or the context died.
    async fn after_run(&self, id: WorkerId, outcome: RequestOutcome) {
        match outcome {
            RequestOutcome::Finished => {
                let oneshot_worker = self.definition.config().oneshot_workers;
                {
                    let mut inner = self.inner.lock().await;
                    if let Some(pos) = inner.workers.iter().position(|slot| slot.id == id) {
                        if oneshot_worker {
                            let slot = inner.workers.remove(pos);
                            if let Some(proxy) = slot.proxy {
                                proxy.terminate();
                            }
                            debug!(task = self.task_name(), worker = %id, "one-shot worker retired");
                        } else {
                            let slot = &mut inner.workers[pos];
                            slot.serving = None;
                            if let Some(proxy) = &slot.proxy {
                                proxy.set_state(WorkerState::Ready);
                            }
                        }
                    }
                }
                self.dispatch_cycle().await;
            }
            RequestOutcome::ContextLost => {
                {
                    let mut inner = self.inner.lock().await;
                    if let Some(slot) = inner.workers.iter_mut().find(|slot| slot.id == id) {
                        slot.serving = None;
                    }
                }
                self.handle_worker_loss(
                    id,
                    OffloadError::TransportFailure {
                        message: format!("{id} terminated while busy"),
                    },
                )
                .await;
            }
        }
    }

    /// Discard a dead instance and apply the respawn/propagation policy.
    ///
    /// Transport failures consume the respawn budget; once it is spent the
    /// pool is poisoned and spawns no replacements. Initialization failures
    /// never consume the budget, but leave the instance terminated.
    async fn handle_worker_loss(&self, id: WorkerId, error: OffloadError) {
        let mut rejected: Vec<ExecutionRequest> = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            if inner.disposed {
                return;
            }
            if let Some(pos) = inner.workers.iter().position(|slot| slot.id == id) {
                let slot = inner.workers.remove(pos);
                if let Some(proxy) = slot.proxy {
                    proxy.terminate();
                }
            }

            let transport = matches!(error, OffloadError::TransportFailure { .. });
            if transport {
                if inner.respawns_remaining > 0 {
                    inner.respawns_remaining -= 1;
                    info!(
                        task = self.task_name(),
                        worker = %id,
                        remaining = inner.respawns_remaining,
                        "worker lost, respawn budget consumed"
                    );
                } else {
                    inner.poisoned = true;
                    warn!(task = self.task_name(), worker = %id, "respawn budget exhausted");
                }
            }

            // Still-queued requests are only failed once no live instance can
            // serve them: a poisoned pool after a transport loss, or an
            // initialization failure that left the pool empty.
            let drain = inner.workers.is_empty() && (inner.poisoned || !transport);
            if drain {
                rejected.extend(inner.queue.drain(..));
            }
        }

        for request in rejected {
            let _ = request.completion.send(Err(error.clone()));
        }
        self.dispatch_cycle().await;
    }

    /// Cancel a request by correlation id.
    ///
    /// Queued requests are removed directly and rejected with `Cancelled`; a
    /// dispatched request can only be cancelled by terminating its instance,
    /// which rejects it with `TransportFailure`.
    pub(crate) async fn cancel(&self, correlation_id: CorrelationId) -> CancelOutcome {
        let request = {
            let mut inner = self.inner.lock().await;
            if let Some(pos) = inner
                .queue
                .iter()
                .position(|request| request.correlation_id == correlation_id)
            {
                inner.queue.remove(pos)
            } else if let Some(slot) = inner
                .workers
                .iter()
                .find(|slot| slot.serving == Some(correlation_id))
            {
                if let Some(proxy) = &slot.proxy {
                    // The drive task observes the closed reply stream and
                    // rejects the handle with TransportFailure.
                    proxy.terminate();
                }
                return CancelOutcome::Terminating;
            } else {
                return CancelOutcome::NotFound;
            }
        };

        match request {
            Some(request) => {
                let _ = request.completion.send(Err(OffloadError::Cancelled));
                info!(
                    task = self.task_name(),
                    correlation_id = %correlation_id,
                    "queued request cancelled"
                );
                CancelOutcome::Dequeued
            }
            None => CancelOutcome::NotFound,
        }
    }

    /// Terminate every instance and reject all queued and in-flight work with
    /// `TransportFailure`. Idempotent: later calls find the pool drained.
    pub(crate) async fn dispose(&self) {
        let (requests, proxies) = {
            let mut inner = self.inner.lock().await;
            if inner.disposed {
                return;
            }
            inner.disposed = true;
            let requests: Vec<ExecutionRequest> = inner.queue.drain(..).collect();
            let proxies: Vec<Arc<WorkerProxy>> = inner
                .workers
                .drain(..)
                .filter_map(|slot| slot.proxy)
                .collect();
            (requests, proxies)
        };

        info!(
            task = self.task_name(),
            rejected = requests.len(),
            terminated = proxies.len(),
            "disposing worker pool"
        );

        // Busy drive tasks observe the loss and reject their in-flight handles.
        for proxy in proxies {
            proxy.terminate();
        }
        for request in requests {
            let _ = request.completion.send(Err(OffloadError::TransportFailure {
                message: format!("task '{}' disposed", self.task_name()),
            }));
        }
    }

    /// Point-in-time counters.
    pub(crate) async fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().await;
        let mut idle_workers = 0;
        let mut busy_workers = 0;
        let mut initializing_workers = 0;
        for slot in &inner.workers {
            match slot.proxy.as_ref().map(|proxy| proxy.state()) {
                Some(WorkerState::Ready) => idle_workers += 1,
                Some(WorkerState::Busy) => busy_workers += 1,
                Some(WorkerState::Spawning) | Some(WorkerState::Initializing) | None => {
                    initializing_workers += 1
                }
                Some(WorkerState::Terminated) => {}
            }
        }
        PoolStats {
            task_name: self.task_name().to_string(),
            total_workers: inner.workers.len(),
            idle_workers,
            busy_workers,
            initializing_workers,
            queued_requests: inner.queue.len(),
            respawns_remaining: inner.respawns_remaining,
            disposed: inner.disposed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::config::TaskConfig;
    use crate::task::{TaskContext, TaskModule, WorkerTask};
    use crate::worker::context::LocalSpawner;

    struct NopTask;

    #[async_trait]
    impl WorkerTask for NopTask {
        async fn init(&mut self, _ctx: &TaskContext, _config: &TaskConfig) -> Result<()> {
            Ok(())
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

    fn nop_pool(config: TaskConfig) -> Arc<WorkerPool> {
        let module: Arc<dyn TaskModule> = Arc::new(|| Box::new(NopTask) as Box<dyn WorkerTask>);
        WorkerPool::new(
            TaskDefinition::new("nop", module).with_config(config),
            Arc::new(LocalSpawner::default()),
        )
    }

    #[tokio::test]
    async fn test_empty_pool_stats() {
        let pool = nop_pool(TaskConfig::default());
        let stats = pool.stats().await;
        assert_eq!(stats.total_workers, 0);
        assert_eq!(stats.queued_requests, 0);
        assert_eq!(stats.respawns_remaining, 3);
        assert!(!stats.disposed);
    }

    #[tokio::test]
    async fn test_schedule_on_disposed_pool_rejects() {
        let pool = nop_pool(TaskConfig::default());
        pool.dispose().await;

        let handle = pool.schedule(serde_json::json!({}), Vec::new(), None).await;
        assert!(matches!(
            handle.wait().await,
            Err(OffloadError::TransportFailure { .. })
        ));
        assert!(pool.stats().await.disposed);
    }

    #[tokio::test]
    async fn test_cancel_unknown_request() {
        let pool = nop_pool(TaskConfig::default());
        let outcome = pool.cancel(CorrelationId::new()).await;
        assert_eq!(outcome, CancelOutcome::NotFound);
    }
}
