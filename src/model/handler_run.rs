//! The `HandlerRun` entity and its dual phase/status state machines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::mutation::Resolution;

/// Whether a handler run belongs to a producer or a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    Producer,
    Consumer,
}

/// Monotonically forward progress marker for a handler run.
///
/// Producer phases: `Pending -> Executing -> Committed`.
/// Consumer phases: `Pending -> Preparing -> Prepared -> Mutating -> Mutated
/// -> Emitting -> Committed`.
///
/// Phase only ever advances within one run; resuming after an interruption
/// creates a *new* run (`retry_of`) whose starting phase is computed by the
/// crash-pairing rule, not a rewind of this one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Pending,
    Executing,
    Preparing,
    Prepared,
    Mutating,
    Mutated,
    Emitting,
    Committed,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Executing => "executing",
            Self::Preparing => "preparing",
            Self::Prepared => "prepared",
            Self::Mutating => "mutating",
            Self::Mutated => "mutated",
            Self::Emitting => "emitting",
            Self::Committed => "committed",
        };
        write!(f, "{s}")
    }
}

/// Disposition of a handler run, orthogonal to `phase`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerRunStatus {
    /// Currently owned and executing.
    Active,
    /// Interrupted by a transient failure; the scheduler will retry it.
    PausedTransient,
    /// Interrupted by an auth/permission failure; needs user action.
    PausedApproval,
    /// Interrupted by an in-flight-at-crash mutation; needs reconciliation.
    PausedReconciliation,
    /// Terminated by a script-level logic error; triggers maintenance.
    FailedLogic,
    /// Terminated by an internal host bug.
    FailedInternal,
    /// Finished normally.
    Committed,
    /// Process died mid-run; only ever observed transiently during
    /// recovery before the crash-pairing rule reassigns a real status.
    Crashed,
}

impl HandlerRunStatus {
    /// A run is terminal iff status is one of committed/failed:*/crashed.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Committed | Self::FailedLogic | Self::FailedInternal | Self::Crashed
        )
    }
}

impl std::fmt::Display for HandlerRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::PausedTransient => "paused:transient",
            Self::PausedApproval => "paused:approval",
            Self::PausedReconciliation => "paused:reconciliation",
            Self::FailedLogic => "failed:logic",
            Self::FailedInternal => "failed:internal",
            Self::Committed => "committed",
            Self::Crashed => "crashed",
        };
        write!(f, "{s}")
    }
}

/// Taxonomic kind of a handler-run-blocking error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Auth,
    Permission,
    Network,
    Logic,
    Unknown,
}

impl std::fmt::Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Auth => "auth",
            Self::Permission => "permission",
            Self::Network => "network",
            Self::Logic => "logic",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Denormalised summary of a mutation's outcome as recorded on the handler
/// run. The mutation row is always authoritative;
/// this is rebuilt from it on every read used for scheduling or recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationOutcome {
    None,
    Success,
    Failure,
    Skipped,
}

impl Default for MutationOutcome {
    fn default() -> Self {
        Self::None
    }
}

/// A (topic, ids) group of events a consumer's `prepare` asked to reserve.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reservation {
    pub topic: String,
    pub ids: Vec<Uuid>,
}

/// The structured result of invoking a consumer's `prepare` hook.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PrepareResult {
    pub reservations: Vec<Reservation>,
    pub ui_title: Option<String>,
    /// Requested wake time; the Execution Model Manager clamps this to
    /// `[now+30s, now+24h]` before persisting.
    pub wake_at: Option<DateTime<Utc>>,
    pub state: Option<serde_json::Value>,
}

/// One execution attempt of one producer or consumer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandlerRun {
    pub id: Uuid,
    /// The umbrella session this run executes under.
    pub script_run_id: Uuid,
    pub workflow_id: Uuid,
    pub handler_type: HandlerKind,
    pub handler_name: String,
    pub phase: Phase,
    pub status: HandlerRunStatus,
    pub input_state: Option<serde_json::Value>,
    pub prepare_result: Option<PrepareResult>,
    pub output_state: Option<serde_json::Value>,
    pub mutation_outcome: MutationOutcome,
    /// Points at the previous attempt in a linear retry chain.
    pub retry_of: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Microdollars.
    pub cost: u64,
    pub error: Option<String>,
    pub error_type: Option<ErrorType>,
    pub logs: Vec<String>,
    pub resolved_by: Option<Resolution>,
}

impl HandlerRun {
    pub fn new_producer(
        script_run_id: Uuid,
        workflow_id: Uuid,
        handler_name: impl Into<String>,
    ) -> Self {
        Self::new(script_run_id, workflow_id, HandlerKind::Producer, handler_name, None)
    }

    pub fn new_consumer(
        script_run_id: Uuid,
        workflow_id: Uuid,
        handler_name: impl Into<String>,
    ) -> Self {
        Self::new(script_run_id, workflow_id, HandlerKind::Consumer, handler_name, None)
    }

    fn new(
        script_run_id: Uuid,
        workflow_id: Uuid,
        handler_type: HandlerKind,
        handler_name: impl Into<String>,
        retry_of: Option<Uuid>,
    ) -> Self {
        Self {
            id: super::new_id(),
            script_run_id,
            workflow_id,
            handler_type,
            handler_name: handler_name.into(),
            phase: Phase::Pending,
            status: HandlerRunStatus::Active,
            input_state: None,
            prepare_result: None,
            output_state: None,
            mutation_outcome: MutationOutcome::None,
            retry_of,
            started_at: Utc::now(),
            ended_at: None,
            cost: 0,
            error: None,
            error_type: None,
            logs: Vec::new(),
            resolved_by: None,
        }
    }

    /// Builds a retry run continuing the chain from `self`, starting at
    /// `phase` as computed by the crash-pairing rule.
    ///
    /// The row is queued, not yet executing: `status` starts at
    /// `paused:transient` rather than `active` so it is only reachable via
    /// `workflows.pending_retry_run_id`, not `list_active_handler_runs`. A
    /// second recovery pass before the scheduler dispatches it must not
    /// re-select and re-crash it. The scheduler flips it back to `active`
    /// when it actually resumes the run.
    pub fn retry_at_phase(&self, phase: Phase) -> Self {
        let mut run = Self::new(
            self.script_run_id,
            self.workflow_id,
            self.handler_type,
            self.handler_name.clone(),
            Some(self.id),
        );
        run.phase = phase;
        run.input_state = self.input_state.clone();
        run.status = HandlerRunStatus::PausedTransient;
        run
    }

    /// Whether this run is terminal.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Follows `retry_of` to find whether `candidate` is a (possibly
    /// indirect) predecessor of this run in its retry chain. Used by tests
    /// and diagnostics; the store itself only ever needs one hop at a
    /// time.
    pub fn follows(&self, candidate: Uuid, all: &[HandlerRun]) -> bool {
        let mut cursor = self.retry_of;
        while let Some(id) = cursor {
            if id == candidate {
                return true;
            }
            cursor = all.iter().find(|r| r.id == id).and_then(|r| r.retry_of);
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_run_starts_pending_and_active() {
        let run = HandlerRun::new_consumer(Uuid::now_v7(), Uuid::now_v7(), "on_email");
        assert_eq!(run.phase, Phase::Pending);
        assert_eq!(run.status, HandlerRunStatus::Active);
        assert!(run.retry_of.is_none());
    }

    #[test]
    fn retry_points_back_to_predecessor() {
        let first = HandlerRun::new_consumer(Uuid::now_v7(), Uuid::now_v7(), "on_email");
        let retry = first.retry_at_phase(Phase::Mutating);
        assert_eq!(retry.retry_of, Some(first.id));
        assert_eq!(retry.phase, Phase::Mutating);
    }

    #[test]
    fn retry_starts_queued_not_active() {
        let first = HandlerRun::new_consumer(Uuid::now_v7(), Uuid::now_v7(), "on_email");
        let retry = first.retry_at_phase(Phase::Mutating);
        assert_eq!(retry.status, HandlerRunStatus::PausedTransient);
        assert_ne!(retry.status, HandlerRunStatus::Active);
    }

    #[test]
    fn phase_ordering_is_monotonic_comparable() {
        assert!(Phase::Preparing < Phase::Prepared);
        assert!(Phase::Mutated < Phase::Emitting);
        assert!(Phase::Emitting < Phase::Committed);
    }

    #[test]
    fn terminal_statuses() {
        assert!(HandlerRunStatus::Committed.is_terminal());
        assert!(HandlerRunStatus::FailedLogic.is_terminal());
        assert!(HandlerRunStatus::FailedInternal.is_terminal());
        assert!(!HandlerRunStatus::Active.is_terminal());
        assert!(!HandlerRunStatus::PausedTransient.is_terminal());
    }

    #[test]
    fn follows_walks_the_retry_chain() {
        let first = HandlerRun::new_consumer(Uuid::now_v7(), Uuid::now_v7(), "on_email");
        let second = first.retry_at_phase(Phase::Mutating);
        let third = second.retry_at_phase(Phase::Emitting);
        let all = vec![first.clone(), second.clone(), third.clone()];
        assert!(third.follows(first.id, &all));
        assert!(!first.follows(third.id, &all));
    }
}
