//! The `HandlerState` entity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-(workflow, handler_name) persistent blob plus a wake_at timestamp.
///
/// `wake_at == None` means "no scheduled wake"; the scheduler's consumer
/// wake step only considers rows with
/// `0 < wake_at <= now`, which this type expresses as `Some(t) if t <= now`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandlerState {
    pub workflow_id: Uuid,
    pub handler_name: String,
    pub state: serde_json::Value,
    /// Set from a consumer's own `PrepareResult::wake_at` request.
    pub wake_at: Option<DateTime<Utc>>,
    /// Consecutive transient (`error_type=network`) failures for this
    /// handler. Drives the exponential delay in `retry_wake_at`; reset to
    /// 0 on the handler's next successful commit.
    pub transient_retry_count: u32,
    /// Backoff wake time scheduled by a transient-failure retry, kept
    /// separate from `wake_at` so a handler-requested wake is never
    /// clobbered by retry bookkeeping (or vice versa).
    pub retry_wake_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl HandlerState {
    pub fn new(workflow_id: Uuid, handler_name: impl Into<String>) -> Self {
        Self {
            workflow_id,
            handler_name: handler_name.into(),
            state: serde_json::Value::Null,
            wake_at: None,
            transient_retry_count: 0,
            retry_wake_at: None,
            updated_at: Utc::now(),
        }
    }

    /// Either the handler's own requested wake or a pending transient-retry
    /// backoff has elapsed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.wake_at.is_some_and(|t| t <= now) || self.retry_wake_at.is_some_and(|t| t <= now)
    }

    /// Whether pending events for this handler should be held back because
    /// a transient-retry backoff is still in effect; only the
    /// consumer-wake step (not the pending-events step) may dispatch it
    /// until `retry_wake_at` elapses.
    pub fn is_backing_off(&self, now: DateTime<Utc>) -> bool {
        self.retry_wake_at.is_some_and(|t| t > now)
    }

    /// The earlier of the two wake sources, for tie-breaking among several
    /// due rows. `None` only when neither is scheduled.
    pub fn effective_wake_at(&self) -> Option<DateTime<Utc>> {
        match (self.wake_at, self.retry_wake_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }
}
