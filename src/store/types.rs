//! Small request/response types shared across [`super::Store`] methods.
//!
//! None of these carry behaviour; they exist so the trait's methods stay
//! readable instead of taking long positional tuples.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{CausedBy, EventStatus};

/// A request to publish one event, as the handler-authored API hands it
/// to the Execution Model Manager.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub topic: String,
    pub message_id: String,
    pub payload: serde_json::Value,
    pub caused_by: CausedBy,
}

/// Filter for `peek_events`. Defaults to the oldest pending events.
#[derive(Debug, Clone)]
pub struct PeekFilter {
    pub limit: usize,
    pub status: EventStatus,
}

impl Default for PeekFilter {
    fn default() -> Self {
        Self {
            limit: 100,
            status: EventStatus::Pending,
        }
    }
}

/// One (topic, event ids) group to reserve, mirroring `PrepareResult::reservations`.
#[derive(Debug, Clone)]
pub struct ReservationRequest {
    pub topic: String,
    pub ids: Vec<Uuid>,
}

/// A newly registered (or deduplicated) external signal, as handed to
/// `register_input` before the store assigns (or reuses) an id.
#[derive(Debug, Clone)]
pub struct InputRequest {
    pub source: String,
    pub input_type: String,
    pub external_id: String,
    pub title: String,
}

/// A point in time the store should treat as "now" for due-comparisons.
/// Threaded explicitly (rather than calling `Utc::now()` inside the store)
/// so that scheduler and recovery logic stay deterministic under test.
pub type Now = DateTime<Utc>;
