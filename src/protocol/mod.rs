//! Message protocol: the command envelope and its dispatch rule on both
//! sides of the context boundary, independent of transport.

pub mod command;
pub mod dispatch;

pub use command::{
    CommandEnvelope, CorrelationId, ReplyEnvelope, WireError, WorkerCommand, WorkerReply,
};
pub use dispatch::{PendingRequest, ProgressFn, ReplyRouter, RouteOutcome, WorkerDispatcher};
