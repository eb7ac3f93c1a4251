//! Domain entities for the execution model.
//!
//! Every type here is a plain data record matching one table described in
//! the data model: [`Workflow`], [`Script`], [`Topic`], [`Event`], [`Input`],
//! [`Mutation`], [`HandlerRun`], [`HandlerState`], [`ProducerSchedule`], and
//! [`Session`]. None of these types carry behaviour beyond small invariant
//! helpers; all lifecycle logic lives in [`crate::engine`].

mod event;
mod handler_config;
mod handler_run;
mod handler_state;
mod input;
mod mutation;
mod producer_schedule;
mod script;
mod session;
mod workflow;

pub use event::{CausedBy, Event, EventStatus, Topic};
pub use handler_config::{ConsumerDeclaration, ProducerDeclaration, WorkflowHandlerConfig};
pub use handler_run::{
    ErrorType, HandlerKind, HandlerRun, HandlerRunStatus, MutationOutcome, Phase, PrepareResult,
    Reservation,
};
pub use handler_state::HandlerState;
pub use input::Input;
pub use mutation::{Mutation, MutationStatus, MutationTransitionError, Resolution};
pub use producer_schedule::{ProducerSchedule, ScheduleType};
pub use script::{Script, ScriptType};
pub use session::{Session, SessionTrigger};
pub use workflow::{Workflow, WorkflowStatus};

use uuid::Uuid;

/// Generates a time-ordered identifier for a new row.
///
/// All primary keys in the model are UUIDv7 so that insertion order is
/// recoverable from the id alone, matching the convention the Postgres
/// store relies on for its default orderings.
pub fn new_id() -> Uuid {
    Uuid::now_v7()
}
