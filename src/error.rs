//! Structured error handling for the scheduling and transfer core.

use thiserror::Error;

/// Errors produced by the scheduling and transfer subsystem.
///
/// Registration and lookup failures are returned synchronously from the
/// [`TaskManager`](crate::TaskManager); every worker-originated failure is
/// delivered asynchronously through the rejected completion handle of the
/// request it belongs to, never thrown into unrelated call stacks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OffloadError {
    /// A task with the same name is already registered and no override was
    /// requested. Nothing is mutated.
    #[error("task already registered: {name}")]
    RegistrationConflict { name: String },

    /// The referenced task name was never registered.
    #[error("unknown task: {name}")]
    UnknownTask { name: String },

    /// The worker's `init` handler reported an error; the instance is marked
    /// terminated and never reused.
    #[error("worker initialization failed: {message}")]
    InitializationFailure { message: String },

    /// The worker's `execute` handler reported a task-domain error (e.g.
    /// malformed input). The instance returns to ready.
    #[error("task execution failed: {message}")]
    ExecutionFailure { message: String },

    /// The execution context died or became unreachable mid-request.
    #[error("worker transport failed: {message}")]
    TransportFailure { message: String },

    /// Metadata and transfer list disagree during payload packaging or
    /// reconstruction.
    #[error("payload packaging failed: {message}")]
    PackagingFailure { message: String },

    /// The request was removed from the queue before dispatch.
    #[error("request cancelled before dispatch")]
    Cancelled,

    /// Invalid environment or task configuration.
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },
}

pub type Result<T> = std::result::Result<T, OffloadError>;
