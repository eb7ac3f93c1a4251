//! The `Session` (script run) entity — the umbrella record for one
//! scheduler tick's activity on one workflow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What caused the scheduler to open this session, mirroring the
/// selection order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionTrigger {
    PendingRetry,
    Reconciliation,
    ProducerSchedule,
    ConsumerWake,
    PendingEvent,
}

/// The umbrella record for one scheduler tick's activity on one workflow.
///
/// A session is finalised (`ended_at` set) once every handler run it owns
/// reaches a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub trigger: SessionTrigger,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn open(workflow_id: Uuid, trigger: SessionTrigger) -> Self {
        Self {
            id: super::new_id(),
            workflow_id,
            trigger,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }

    pub fn close(&mut self) {
        self.ended_at = Some(Utc::now());
    }
}
