//! Command envelope for controller ⇄ worker messaging.
//!
//! Every message carries a correlation id linking a request to its
//! asynchronous responses. Command and reply kinds are tagged unions matched
//! exhaustively on both sides; the protocol is strictly request/response per
//! correlation id: exactly one `init` acknowledgment, zero or more `progress`
//! replies, exactly one terminal reply per `execute`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::TaskConfig;
use crate::error::OffloadError;
use crate::transfer::{PackedResult, TransferList};

/// Identifier linking a request to its asynchronous responses.
///
/// Generated per request; never reused while the request is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message sent from the controlling side into a worker context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub correlation_id: CorrelationId,
    pub issued_at: DateTime<Utc>,
    pub command: WorkerCommand,
}

impl CommandEnvelope {
    /// Build an `init` command.
    pub fn init(correlation_id: CorrelationId, config: TaskConfig) -> Self {
        Self {
            correlation_id,
            issued_at: Utc::now(),
            command: WorkerCommand::Init { config },
        }
    }

    /// Build an `execute` command.
    pub fn execute(
        correlation_id: CorrelationId,
        params: serde_json::Value,
        transfers: TransferList,
    ) -> Self {
        Self {
            correlation_id,
            issued_at: Utc::now(),
            command: WorkerCommand::Execute { params, transfers },
        }
    }
}

/// Commands dispatched inside a worker context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum WorkerCommand {
    /// Load task configuration; answered by exactly one [`WorkerReply::InitAck`].
    Init { config: TaskConfig },

    /// Run the task once; answered by zero or more progress replies and
    /// exactly one terminal reply.
    Execute {
        params: serde_json::Value,
        transfers: TransferList,
    },
}

/// Message sent from a worker context back to the controlling side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    pub correlation_id: CorrelationId,
    pub sent_at: DateTime<Utc>,
    pub reply: WorkerReply,
}

impl ReplyEnvelope {
    pub fn init_ack(correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id,
            sent_at: Utc::now(),
            reply: WorkerReply::InitAck,
        }
    }

    pub fn progress(correlation_id: CorrelationId, value: serde_json::Value) -> Self {
        Self {
            correlation_id,
            sent_at: Utc::now(),
            reply: WorkerReply::Progress { value },
        }
    }

    pub fn completion(
        correlation_id: CorrelationId,
        data: PackedResult,
        transfers: TransferList,
    ) -> Self {
        Self {
            correlation_id,
            sent_at: Utc::now(),
            reply: WorkerReply::Completion { data, transfers },
        }
    }

    pub fn error(correlation_id: CorrelationId, error: WireError) -> Self {
        Self {
            correlation_id,
            sent_at: Utc::now(),
            reply: WorkerReply::Error { error },
        }
    }

    /// Whether this reply finishes its request.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.reply,
            WorkerReply::Completion { .. } | WorkerReply::Error { .. }
        )
    }
}

/// Replies a worker context sends for one correlation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum WorkerReply {
    /// Acknowledges `init`.
    InitAck,

    /// Intermediate progress report; does not change request state.
    Progress { value: serde_json::Value },

    /// Terminal success carrying the packaged result.
    Completion {
        data: PackedResult,
        transfers: TransferList,
    },

    /// Terminal failure reported by the task or the dispatcher.
    Error { error: WireError },
}

/// Worker-reported failure detail carried in an error reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub error_type: Option<String>,
    pub message: String,
    pub retryable: bool,
}

impl WireError {
    /// Failure reported by the task's `init` handler.
    pub fn initialization(message: impl Into<String>) -> Self {
        Self {
            error_type: Some("initialization".to_string()),
            message: message.into(),
            retryable: false,
        }
    }

    /// Task-domain failure reported by the `execute` handler.
    pub fn execution(message: impl Into<String>) -> Self {
        Self {
            error_type: Some("execution".to_string()),
            message: message.into(),
            retryable: false,
        }
    }

    /// Protocol-state violation, e.g. `execute` before `init`.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self {
            error_type: Some("protocol".to_string()),
            message: message.into(),
            retryable: false,
        }
    }

    /// Map a worker-reported failure onto the controlling-side taxonomy.
    pub fn into_error(self) -> OffloadError {
        match self.error_type.as_deref() {
            Some("initialization") => OffloadError::InitializationFailure {
                message: self.message,
            },
            _ => OffloadError::ExecutionFailure {
                message: self.message,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::StructuredResult;

    #[test]
    fn test_envelope_constructors_correlate() {
        let id = CorrelationId::new();
        let command = CommandEnvelope::execute(id, serde_json::json!({ "value": 3 }), Vec::new());
        assert_eq!(command.correlation_id, id);

        let reply = ReplyEnvelope::progress(id, serde_json::json!(0.5));
        assert_eq!(reply.correlation_id, id);
        assert!(!reply.is_terminal());

        let (data, transfers) = StructuredResult::new().package();
        assert!(ReplyEnvelope::completion(id, data, transfers).is_terminal());
        assert!(ReplyEnvelope::error(id, WireError::execution("bad input")).is_terminal());
    }

    #[test]
    fn test_command_serialization_round_trip() {
        let envelope = CommandEnvelope::init(CorrelationId::new(), TaskConfig::default());

        let json = serde_json::to_string(&envelope).expect("serialize command");
        let decoded: CommandEnvelope = serde_json::from_str(&json).expect("deserialize command");

        assert_eq!(decoded.correlation_id, envelope.correlation_id);
        assert!(matches!(decoded.command, WorkerCommand::Init { .. }));
    }

    #[test]
    fn test_reply_wire_tags() {
        let reply = ReplyEnvelope::progress(CorrelationId::new(), serde_json::json!(1));
        let json = serde_json::to_value(&reply).expect("serialize reply");
        assert_eq!(json["reply"]["cmd"], "progress");

        let reply = ReplyEnvelope::error(CorrelationId::new(), WireError::protocol("oops"));
        let json = serde_json::to_value(&reply).expect("serialize reply");
        assert_eq!(json["reply"]["cmd"], "error");
        assert_eq!(json["reply"]["error"]["error_type"], "protocol");
    }

    #[test]
    fn test_wire_error_mapping() {
        let err = WireError::initialization("no config").into_error();
        assert!(matches!(err, OffloadError::InitializationFailure { .. }));

        let err = WireError::execution("bad mesh").into_error();
        assert!(matches!(err, OffloadError::ExecutionFailure { .. }));
    }
}
