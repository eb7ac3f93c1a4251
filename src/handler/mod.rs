//! The handler-authored API: `Producer` and `Consumer`, the trait
//! boundary the Execution Model Manager calls into for one handler run.
//!
//! The script compiler/runtime that would adapt an interpreted script
//! body to these traits is out of scope; this module supplies only the
//! boundary and the small set of context/result types the lifecycle
//! machinery passes across it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{CausedBy, ErrorType, Event, PrepareResult};

/// Error returned by a handler-authored method, carrying the taxonomic
/// kind the Execution Model Manager uses to pick the post-failure status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandlerError {
    pub message: String,
    pub error_type: ErrorType,
    pub details: Option<serde_json::Value>,
}

impl HandlerError {
    pub fn new(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type,
            details: None,
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorType::Auth, message)
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::new(ErrorType::Permission, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorType::Network, message)
    }

    pub fn logic(message: impl Into<String>) -> Self {
        Self::new(ErrorType::Logic, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorType::Unknown, message)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)
    }
}

impl std::error::Error for HandlerError {}

/// One event a handler wants to publish, mirroring the `{topic,
/// messageId, payload, causedBy?}` shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmitEvent {
    pub topic: String,
    pub message_id: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub caused_by: CausedBy,
}

/// One external signal a producer wants registered in the input ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewInput {
    pub source: String,
    pub input_type: String,
    pub external_id: String,
    pub title: String,
}

/// Context passed to a producer's `run`.
#[derive(Debug, Clone)]
pub struct ProducerContext {
    pub workflow_id: Uuid,
    pub script_run_id: Uuid,
    pub handler_name: String,
    /// Persisted handler state from the previous run, if any.
    pub state: Option<serde_json::Value>,
}

/// The structured result of a producer's `run` hook.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ProducerOutput {
    pub events: Vec<EmitEvent>,
    #[serde(default)]
    pub inputs: Vec<NewInput>,
    pub state: Option<serde_json::Value>,
}

/// A handler that pulls external signals and emits events.
#[async_trait]
pub trait Producer: Send + Sync + 'static {
    async fn run(&self, ctx: &ProducerContext) -> Result<ProducerOutput, HandlerError>;
}

/// Context passed to a consumer's `prepare`/`mutate`/`emit`. The
/// events available to `prepare` are exactly those the scheduler peeked
/// on the consumer's declared topics before invoking it.
#[derive(Debug, Clone)]
pub struct ConsumerContext {
    pub workflow_id: Uuid,
    pub script_run_id: Uuid,
    pub handler_name: String,
    pub state: Option<serde_json::Value>,
    pub allowed_inputs: Vec<Event>,
    /// Populated once `prepare` has run and reservations are known;
    /// `mutate`/`emit` read this to see which events they are acting on.
    pub reserved: Vec<Event>,
}

/// The call a consumer's `mutate` wants the mutation ledger to perform.
/// At most one per run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MutateCall {
    pub tool_namespace: String,
    pub tool_method: String,
    pub params: serde_json::Value,
    pub idempotency_key: String,
    pub ui_title: String,
}

/// The structured result of a consumer's `emit` hook.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct EmitOutput {
    pub events: Vec<EmitEvent>,
}

/// A handler that reacts to events, optionally mutates the outside
/// world, and emits downstream events.
#[async_trait]
pub trait Consumer: Send + Sync + 'static {
    async fn prepare(&self, ctx: &ConsumerContext) -> Result<PrepareResult, HandlerError>;

    /// Default: no mutation. Most consumers that only transform and
    /// re-emit events never override this.
    async fn mutate(&self, ctx: &ConsumerContext) -> Result<Option<MutateCall>, HandlerError> {
        let _ = ctx;
        Ok(None)
    }

    /// Default: no downstream events.
    async fn emit(&self, ctx: &ConsumerContext) -> Result<EmitOutput, HandlerError> {
        let _ = ctx;
        Ok(EmitOutput::default())
    }
}
