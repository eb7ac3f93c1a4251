//! `Topic` and `Event` entities.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A named event stream within a workflow, unique by (workflow_id, name).
/// Created lazily on first publish; never deleted during the workflow's
/// lifetime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Topic {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Topic {
    pub fn new(workflow_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id: super::new_id(),
            workflow_id,
            name: name.into(),
            created_at: Utc::now(),
        }
    }
}

/// Delivery status of one event.
///
/// Transitions only `Pending -> Reserved -> {Consumed, Skipped}` or
/// `Reserved -> Pending` on release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Reserved,
    Consumed,
    Skipped,
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Reserved => "reserved",
            Self::Consumed => "consumed",
            Self::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

/// A deduplicated, ordered set of input ids causally linked to an event.
pub type CausedBy = BTreeSet<Uuid>;

/// An in-flight message on a topic.
///
/// Invariants: `(topic_id, message_id)` is unique;
/// `reserved_by_run_id` is `Some` iff `status == Reserved`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: Uuid,
    pub topic_id: Uuid,
    pub workflow_id: Uuid,
    /// Caller-supplied idempotency key, unique within the topic.
    pub message_id: String,
    pub payload: serde_json::Value,
    pub status: EventStatus,
    pub reserved_by_run_id: Option<Uuid>,
    pub created_by_run_id: Option<Uuid>,
    pub caused_by: CausedBy,
    /// Increments every time the event is released back to pending.
    pub attempt_number: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Event {
    /// Constructs the row that `publishEvent` would insert on first sight
    /// of `(topic_id, message_id)`.
    pub fn new_pending(
        topic_id: Uuid,
        workflow_id: Uuid,
        message_id: impl Into<String>,
        payload: serde_json::Value,
        caused_by: CausedBy,
        created_by_run_id: Option<Uuid>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: super::new_id(),
            topic_id,
            workflow_id,
            message_id: message_id.into(),
            payload,
            status: EventStatus::Pending,
            reserved_by_run_id: None,
            created_by_run_id,
            caused_by,
            attempt_number: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Applies the last-write-wins update a republish performs on an
    /// existing row: payload and caused_by are overwritten, status and
    /// attempt_number are untouched.
    pub fn apply_republish(&mut self, payload: serde_json::Value, caused_by: CausedBy) {
        self.payload = payload;
        self.caused_by = caused_by;
        self.updated_at = Utc::now();
    }

    pub fn is_held_by(&self, run_id: Uuid) -> bool {
        self.status == EventStatus::Reserved && self.reserved_by_run_id == Some(run_id)
    }
}
