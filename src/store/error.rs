//! [`StoreError`] — the error type shared by every [`super::Store`] implementation.

use uuid::Uuid;

/// Error type for storage-primitive operations.
///
/// Every operation in [`super::Store`] is a narrow contract around one
/// table; this enum is intentionally flat rather than per-table so callers
/// can match on it uniformly regardless of which method produced it.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    #[error("script not found: {0}")]
    ScriptNotFound(Uuid),

    #[error("topic not found: {0}")]
    TopicNotFound(Uuid),

    #[error("event not found: {0}")]
    EventNotFound(Uuid),

    #[error("mutation not found: {0}")]
    MutationNotFound(Uuid),

    #[error("handler run not found: {0}")]
    HandlerRunNotFound(Uuid),

    #[error("session not found: {0}")]
    SessionNotFound(Uuid),

    /// Raised by `create_mutation` when `handler_run_id` already owns one.
    #[error("handler run {0} already has a mutation")]
    DuplicateMutation(Uuid),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}
