//! [`ExecutionError`] — the top-level error type for the execution model.
//! Every operation the [`crate::engine::ExecutionModelManager`]
//! exposes returns one of these, so a caller never has to match on the
//! three or four lower-level error types individually.

use uuid::Uuid;

use crate::connector::ConnectorError;
use crate::handler::HandlerError;
use crate::model::MutationTransitionError;
use crate::store::StoreError;

/// Errors raised by the execution model's lifecycle manager.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    MutationTransition(#[from] MutationTransitionError),

    #[error("handler {handler_name} failed: {source}")]
    Handler {
        handler_name: String,
        #[source]
        source: HandlerError,
    },

    #[error(transparent)]
    Connector(#[from] ConnectorError),

    /// Raised when a script attempts a second mutation tool call within
    /// one consumer run (at most one mutation per handler run is
    /// allowed).
    #[error("handler run {0} already performed a mutation this attempt")]
    SecondMutationInOneRun(Uuid),

    /// Raised when a workflow that does not satisfy the scheduler's
    /// preamble conjunction is handed to the manager anyway.
    #[error("workflow {0} is not schedulable")]
    WorkflowNotSchedulable(Uuid),

    /// Raised when recovery's crash-pairing rule encounters a
    /// handler run whose recorded phase/status/mutation combination does
    /// not correspond to any documented case.
    #[error("handler run {0} is in an unrecognized crash state: phase={1}, status={2}")]
    UnrecognizedCrashState(Uuid, &'static str, &'static str),
}
