//! Top-level task registry and scheduling entry point.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::error::{OffloadError, Result};
use crate::protocol::command::CorrelationId;
use crate::protocol::dispatch::ProgressFn;
use crate::task::TaskDefinition;
use crate::transfer::TransferList;
use crate::worker::context::{ContextSpawner, LocalSpawner};
use crate::worker::pool::{CancelOutcome, CompletionHandle, PoolStats, WorkerPool};

/// Options for [`TaskManager::register`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RegistrationOptions {
    /// Replace an existing registration instead of failing with
    /// [`OffloadError::RegistrationConflict`]. The old pool is disposed
    /// before the new definition takes its name.
    pub replace_existing: bool,
}

/// Options for [`TaskManager::schedule_with_options`].
#[derive(Clone, Default)]
pub struct ScheduleOptions {
    /// Invoked for each progress reply before the request resolves.
    pub progress: Option<ProgressFn>,
}

impl std::fmt::Debug for ScheduleOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduleOptions")
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// Registry mapping task names to worker pools; the entry point for
/// scheduling and teardown.
///
/// An explicit instance passed by reference to callers; there is no global
/// singleton. Registration writes the registry, scheduling only reads it, so
/// concurrent registration and scheduling are safe.
pub struct TaskManager {
    pools: DashMap<String, Arc<WorkerPool>>,
    spawner: Arc<dyn ContextSpawner>,
}

impl TaskManager {
    /// Manager using in-process execution contexts.
    pub fn new() -> Self {
        Self::with_spawner(Arc::new(LocalSpawner::default()))
    }

    /// Manager spawning contexts through a custom provider.
    pub fn with_spawner(spawner: Arc<dyn ContextSpawner>) -> Self {
        Self {
            pools: DashMap::new(),
            spawner,
        }
    }

    /// Register a task definition, creating its (empty) worker pool.
    ///
    /// Fails with [`OffloadError::RegistrationConflict`] if the name already
    /// exists and `replace_existing` was not requested; nothing is mutated in
    /// that case.
    pub async fn register(
        &self,
        definition: TaskDefinition,
        options: RegistrationOptions,
    ) -> Result<()> {
        let name = definition.name().to_string();

        if options.replace_existing {
            if let Some((_, old)) = self.pools.remove(&name) {
                info!(task = %name, "replacing existing registration");
                old.dispose().await;
            }
            self.pools
                .insert(name.clone(), WorkerPool::new(definition, Arc::clone(&self.spawner)));
        } else {
            match self.pools.entry(name.clone()) {
                dashmap::mapref::entry::Entry::Occupied(_) => {
                    return Err(OffloadError::RegistrationConflict { name });
                }
                dashmap::mapref::entry::Entry::Vacant(entry) => {
                    entry.insert(WorkerPool::new(definition, Arc::clone(&self.spawner)));
                }
            }
        }

        info!(task = %name, "task registered");
        Ok(())
    }

    /// Schedule one execution of a registered task.
    ///
    /// Returns a completion handle immediately; resolution happens
    /// asynchronously when the worker's terminal reply arrives.
    pub async fn schedule(
        &self,
        name: &str,
        params: serde_json::Value,
        transfers: TransferList,
    ) -> Result<CompletionHandle> {
        self.schedule_with_options(name, params, transfers, ScheduleOptions::default())
            .await
    }

    /// [`schedule`](Self::schedule) with a progress callback.
    pub async fn schedule_with_options(
        &self,
        name: &str,
        params: serde_json::Value,
        transfers: TransferList,
        options: ScheduleOptions,
    ) -> Result<CompletionHandle> {
        let pool = self.pool(name)?;
        Ok(pool.schedule(params, transfers, options.progress).await)
    }

    /// Cancel a request by correlation id.
    pub async fn cancel(&self, name: &str, correlation_id: CorrelationId) -> Result<CancelOutcome> {
        let pool = self.pool(name)?;
        Ok(pool.cancel(correlation_id).await)
    }

    /// Tear down a task: terminate its instances, reject outstanding work
    /// with `TransportFailure`, remove the definition.
    ///
    /// Idempotent: disposing an unknown or already disposed name is a no-op.
    pub async fn dispose(&self, name: &str) {
        match self.pools.remove(name) {
            Some((_, pool)) => pool.dispose().await,
            None => debug!(task = %name, "dispose of unregistered task ignored"),
        }
    }

    /// Dispose every registered task.
    pub async fn dispose_all(&self) {
        let pools: Vec<Arc<WorkerPool>> = self
            .pools
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.pools.clear();
        futures::future::join_all(pools.iter().map(|pool| pool.dispose())).await;
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.pools.contains_key(name)
    }

    pub fn task_names(&self) -> Vec<String> {
        self.pools.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Point-in-time statistics for a task's pool.
    pub async fn pool_stats(&self, name: &str) -> Result<PoolStats> {
        let pool = self.pool(name)?;
        Ok(pool.stats().await)
    }

    fn pool(&self, name: &str) -> Result<Arc<WorkerPool>> {
        self.pools
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| OffloadError::UnknownTask {
                name: name.to_string(),
            })
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}
