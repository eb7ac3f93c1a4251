//! The `Workflow` entity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a workflow.
///
/// The scheduler only ever selects a workflow for execution when it is
/// `Active` and also satisfies the conjunction of conditions documented
/// on [`Workflow::is_schedulable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Created, no script saved yet.
    Draft,
    /// A script has been saved but the user has not activated it.
    Ready,
    /// Eligible for scheduling (subject to the other conjuncts).
    Active,
    /// User-paused; excluded from scheduling.
    Paused,
    /// System needs user attention (e.g. maintenance cap exceeded).
    Error,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Draft => "draft",
            Self::Ready => "ready",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// One user automation.
///
/// Invariants: at most one active script per workflow (`active_script_id`);
/// the scheduler runs a workflow only when `status == Active`, `error` is
/// empty, and `maintenance` is false.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workflow {
    pub id: Uuid,
    pub title: String,
    pub status: WorkflowStatus,
    /// User-controlled maintenance flag. While set, a maintainer script is
    /// being authored out of band and the scheduler skips the workflow.
    pub maintenance: bool,
    /// Number of maintainer cycles triggered so far; reset is not automatic.
    pub maintenance_fix_count: u32,
    /// System-controlled error description, distinct from `status`.
    pub error: String,
    pub active_script_id: Option<Uuid>,
    /// Declared producer/consumer set with per-producer schedules, opaque
    /// to the execution model beyond being stored and handed back to the
    /// script runtime.
    pub handler_config: serde_json::Value,
    /// Structured user intent, opaque to the execution model.
    pub intent_spec: serde_json::Value,
    /// Set transactionally by recovery and consumed by the
    /// scheduler's selection order item 1.
    pub pending_retry_run_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: super::new_id(),
            title: title.into(),
            status: WorkflowStatus::Draft,
            maintenance: false,
            maintenance_fix_count: 0,
            error: String::new(),
            active_script_id: None,
            handler_config: serde_json::Value::Null,
            intent_spec: serde_json::Value::Null,
            pending_retry_run_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the scheduler is allowed to run this workflow on a tick.
    pub fn is_schedulable(&self) -> bool {
        self.status == WorkflowStatus::Active && self.error.is_empty() && !self.maintenance
    }

    /// Enters maintenance mode, incrementing `maintenance_fix_count`.
    pub fn enter_maintenance(&mut self) {
        self.maintenance = true;
        self.maintenance_fix_count += 1;
        self.updated_at = Utc::now();
    }

    pub fn exit_maintenance(&mut self) {
        self.maintenance = false;
        self.updated_at = Utc::now();
    }

    /// Transitions to `Error` with the given description, excluding the
    /// workflow from scheduling until a user resolves it.
    pub fn enter_error(&mut self, description: impl Into<String>) {
        self.status = WorkflowStatus::Error;
        self.error = description.into();
        self.updated_at = Utc::now();
    }
}
