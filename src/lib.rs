#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Offload Core
//!
//! Worker-task scheduling and transfer core for offloading CPU-heavy decode
//! work (e.g. mesh and material parsing) to a pool of isolated background
//! execution contexts.
//!
//! ## Overview
//!
//! The crate coordinates request/response correlation across an asynchronous
//! message channel and moves large binary buffers between the controlling and
//! worker sides without copying. Task implementations (the actual parsers)
//! are external collaborators plugged in through the [`WorkerTask`] trait.
//!
//! ## Architecture
//!
//! - [`TaskManager`]: registry mapping task names to pool configuration and
//!   source; the entry point for scheduling and teardown.
//! - [`WorkerPool`](worker::WorkerPool): bounded instance set per task with
//!   a FIFO pending queue and dispatch fairness.
//! - [`WorkerProxy`](worker::WorkerProxy): wraps one execution context and
//!   correlates its outstanding request to responses.
//! - [`protocol`]: the command envelope and its dispatch rule on both sides,
//!   independent of transport.
//! - [`transfer`]: packaging of structured results whose buffers move across
//!   the context boundary as a transfer list.
//!
//! Contexts share no memory with the controlling side; ownership of
//! transferred buffers moves, so no locks guard buffer access.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use offload_core::{
//!     RegistrationOptions, StructuredResult, TaskConfig, TaskContext, TaskDefinition,
//!     TaskManager, TransferList, WorkerTask,
//! };
//!
//! struct DoubleTask;
//!
//! #[async_trait]
//! impl WorkerTask for DoubleTask {
//!     async fn init(&mut self, _ctx: &TaskContext, _config: &TaskConfig) -> offload_core::Result<()> {
//!         Ok(())
//!     }
//!
//!     async fn execute(
//!         &mut self,
//!         _ctx: &TaskContext,
//!         _config: &TaskConfig,
//!         params: serde_json::Value,
//!         _transfers: TransferList,
//!     ) -> offload_core::Result<StructuredResult> {
//!         let value = params["value"].as_i64().unwrap_or(0);
//!         Ok(StructuredResult::new().with_data("result", serde_json::json!(value * 2)))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> offload_core::Result<()> {
//!     let manager = TaskManager::new();
//!     let definition = TaskDefinition::new(
//!         "double",
//!         Arc::new(|| Box::new(DoubleTask) as Box<dyn WorkerTask>),
//!     );
//!     manager.register(definition, RegistrationOptions::default()).await?;
//!
//!     let handle = manager
//!         .schedule("double", serde_json::json!({ "value": 21 }), Vec::new())
//!         .await?;
//!     let result = handle.wait().await?;
//!     println!("doubled: {}", result.data("result").unwrap());
//!
//!     manager.dispose("double").await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod manager;
pub mod protocol;
pub mod task;
pub mod transfer;
pub mod worker;

pub use config::TaskConfig;
pub use error::{OffloadError, Result};
pub use manager::{RegistrationOptions, ScheduleOptions, TaskManager};
pub use protocol::{
    CommandEnvelope, CorrelationId, ProgressFn, ReplyEnvelope, WireError, WorkerCommand,
    WorkerReply,
};
pub use task::{TaskContext, TaskDefinition, TaskModule, WorkerTask};
pub use transfer::{
    ElementType, PackedResult, StructuredResult, TransferDescriptor, TransferList, TypedBuffer,
};
pub use worker::{
    CancelOutcome, CompletionHandle, ContextSpawner, ExecutionContext, LocalSpawner, PoolStats,
    WorkerId, WorkerState,
};
