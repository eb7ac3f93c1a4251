//! The `Mutation` entity and its state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of one mutation.
///
/// ```text
///                    markInFlight             markApplied
///    (create) ─────────────────────► in_flight ───────────► applied
///       │                                │
///       │                                ├─ markFailed ───► failed
///       │                                │
///       │                                ├─ markNeedsReconcile ─► needs_reconcile
///       │                                │
///       │                                └─ markIndeterminate ───► indeterminate
///       ▼
///   pending (pre-call; on crash, equivalent to "no effect")
/// ```
///
/// `applied`, `failed`, `indeterminate` are terminal modulo user
/// resolution; none of them ever transitions back to `pending` or
/// `in_flight`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    Pending,
    InFlight,
    Applied,
    Failed,
    NeedsReconcile,
    Indeterminate,
}

impl std::fmt::Display for MutationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Applied => "applied",
            Self::Failed => "failed",
            Self::NeedsReconcile => "needs_reconcile",
            Self::Indeterminate => "indeterminate",
        };
        write!(f, "{s}")
    }
}

/// How a mutation in `needs_reconcile`/`indeterminate` was ultimately
/// resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    UserAssertApplied,
    UserAssertFailed,
    UserSkip,
    UserRetry,
    Reconciliation,
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::UserAssertApplied => "user_assert_applied",
            Self::UserAssertFailed => "user_assert_failed",
            Self::UserSkip => "user_skip",
            Self::UserRetry => "user_retry",
            Self::Reconciliation => "reconciliation",
        };
        write!(f, "{s}")
    }
}

/// One recorded intent to perform an external side effect, 1:1 with its
/// owning consumer handler_run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Mutation {
    pub id: Uuid,
    pub handler_run_id: Uuid,
    pub workflow_id: Uuid,
    pub tool_namespace: String,
    pub tool_method: String,
    pub params: serde_json::Value,
    /// Connector-chosen idempotency key, passed through to `call`/`reconcile`.
    pub idempotency_key: String,
    pub status: MutationStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub reconcile_attempts: u32,
    pub last_reconcile_at: Option<DateTime<Utc>>,
    pub next_reconcile_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<Resolution>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub ui_title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Error raised when an operation would violate the mutation state
/// machine.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum MutationTransitionError {
    #[error("mutation {0} is terminal ({1}) and cannot transition to {2}")]
    Terminal(Uuid, &'static str, &'static str),
}

impl Mutation {
    /// `createInFlight` / plain `create`: builds a new mutation row in
    /// `pending` status, before any external call has been attempted.
    pub fn new_pending(
        handler_run_id: Uuid,
        workflow_id: Uuid,
        tool_namespace: impl Into<String>,
        tool_method: impl Into<String>,
        params: serde_json::Value,
        idempotency_key: impl Into<String>,
        ui_title: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: super::new_id(),
            handler_run_id,
            workflow_id,
            tool_namespace: tool_namespace.into(),
            tool_method: tool_method.into(),
            params,
            idempotency_key: idempotency_key.into(),
            status: MutationStatus::Pending,
            result: None,
            error: None,
            reconcile_attempts: 0,
            last_reconcile_at: None,
            next_reconcile_at: None,
            resolved_by: None,
            resolved_at: None,
            ui_title: ui_title.into(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the mutation has already reached a terminal status. Used
    /// to reject transitions into an earlier state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            MutationStatus::Applied | MutationStatus::Failed | MutationStatus::Indeterminate
        )
    }

    fn transition_guard(&self, target: &'static str) -> Result<(), MutationTransitionError> {
        if self.is_terminal() {
            return Err(MutationTransitionError::Terminal(
                self.id,
                match self.status {
                    MutationStatus::Applied => "applied",
                    MutationStatus::Failed => "failed",
                    MutationStatus::Indeterminate => "indeterminate",
                    _ => unreachable!("is_terminal guarantees one of the three arms above"),
                },
                target,
            ));
        }
        Ok(())
    }

    pub fn mark_in_flight(&mut self) -> Result<(), MutationTransitionError> {
        self.transition_guard("in_flight")?;
        self.status = MutationStatus::InFlight;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn mark_applied(&mut self, result: serde_json::Value) -> Result<(), MutationTransitionError> {
        self.transition_guard("applied")?;
        self.status = MutationStatus::Applied;
        self.result = Some(result);
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) -> Result<(), MutationTransitionError> {
        self.transition_guard("failed")?;
        self.status = MutationStatus::Failed;
        self.error = Some(error.into());
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn mark_needs_reconcile(&mut self) -> Result<(), MutationTransitionError> {
        self.transition_guard("needs_reconcile")?;
        self.status = MutationStatus::NeedsReconcile;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn mark_indeterminate(&mut self) -> Result<(), MutationTransitionError> {
        self.transition_guard("indeterminate")?;
        self.status = MutationStatus::Indeterminate;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// `scheduleNextReconcile(id, delayMs)`: atomically increments
    /// `reconcile_attempts`, stamps `last_reconcile_at`, and sets
    /// `next_reconcile_at`.
    pub fn schedule_next_reconcile(&mut self, delay: chrono::Duration) {
        let now = Utc::now();
        self.reconcile_attempts += 1;
        self.last_reconcile_at = Some(now);
        self.next_reconcile_at = Some(now + delay);
        self.updated_at = now;
    }

    /// Records a user or reconciliation resolution. `status` must already
    /// be one of the resolvable statuses; the caller (Execution Model
    /// Manager) is responsible for deriving the right mutation_outcome for
    /// the owning handler_run.
    pub fn resolve(&mut self, resolution: Resolution) {
        self.resolved_by = Some(resolution);
        self.resolved_at = Some(Utc::now());
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_mutation() -> Mutation {
        Mutation::new_pending(
            Uuid::now_v7(),
            Uuid::now_v7(),
            "gmail",
            "send",
            serde_json::json!({}),
            "idem-1",
            "Send email",
        )
    }

    #[test]
    fn happy_path_transitions() {
        let mut m = new_mutation();
        m.mark_in_flight().unwrap();
        assert_eq!(m.status, MutationStatus::InFlight);
        m.mark_applied(serde_json::json!({"id": "abc"})).unwrap();
        assert_eq!(m.status, MutationStatus::Applied);
    }

    #[test]
    fn terminal_statuses_reject_further_transitions() {
        let mut m = new_mutation();
        m.mark_in_flight().unwrap();
        m.mark_applied(serde_json::json!(null)).unwrap();
        assert!(m.mark_in_flight().is_err());
        assert!(m.mark_failed("x").is_err());
        assert!(m.mark_needs_reconcile().is_err());
        assert!(m.mark_indeterminate().is_err());
    }

    #[test]
    fn failed_is_terminal_but_safe_to_retry_at_the_run_level() {
        let mut m = new_mutation();
        m.mark_in_flight().unwrap();
        m.mark_failed("network error").unwrap();
        assert!(m.is_terminal());
        assert!(m.mark_applied(serde_json::json!(null)).is_err());
    }

    #[test]
    fn reconcile_scheduling_increments_attempts() {
        let mut m = new_mutation();
        m.mark_in_flight().unwrap();
        m.mark_needs_reconcile().unwrap();
        m.schedule_next_reconcile(chrono::Duration::seconds(30));
        assert_eq!(m.reconcile_attempts, 1);
        assert!(m.last_reconcile_at.is_some());
        assert!(m.next_reconcile_at.is_some());
        m.schedule_next_reconcile(chrono::Duration::seconds(60));
        assert_eq!(m.reconcile_attempts, 2);
    }

    #[test]
    fn resolution_is_recorded() {
        let mut m = new_mutation();
        m.mark_in_flight().unwrap();
        m.mark_indeterminate().unwrap();
        m.resolve(Resolution::UserAssertFailed);
        assert_eq!(m.resolved_by, Some(Resolution::UserAssertFailed));
        assert!(m.resolved_at.is_some());
    }
}
