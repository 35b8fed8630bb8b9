//! Worker-side building blocks: the execution context abstraction, the
//! per-instance proxy, and the per-task pool.

pub mod context;
pub mod pool;
pub mod proxy;

pub use context::{ContextSpawner, ExecutionContext, LocalContext, LocalSpawner};
pub use pool::{CancelOutcome, CompletionHandle, PoolStats, WorkerPool};
pub use proxy::{WorkerId, WorkerProxy, WorkerState};
