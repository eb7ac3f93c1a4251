//! The `Input` entity — the deduplicated external-signal ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A user-visible external signal, unique by
/// `(workflow_id, source, type, external_id)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Input {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub source: String,
    pub input_type: String,
    pub external_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

impl Input {
    pub fn new(
        workflow_id: Uuid,
        source: impl Into<String>,
        input_type: impl Into<String>,
        external_id: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            id: super::new_id(),
            workflow_id,
            source: source.into(),
            input_type: input_type.into(),
            external_id: external_id.into(),
            title: title.into(),
            created_at: Utc::now(),
        }
    }

    /// The dedup key for this input.
    pub fn dedup_key(&self) -> (Uuid, &str, &str, &str) {
        (self.workflow_id, &self.source, &self.input_type, &self.external_id)
    }
}
