//! The `CollaboratorSink` trait: the boundary to the out-of-scope
//! collaborators — the planner/maintainer agent that authors
//! maintenance scripts, and the notification sink that tells a user their
//! workflow needs attention.
//!
//! The embedding process supplies the real implementation; this crate
//! only needs to call it at the right moments and to offer a
//! capturing no-op double for its own tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of notification the scheduler can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    Error,
    Escalated,
    MaintenanceFailed,
    ScriptMessage,
    ScriptAsk,
}

/// One notification handed to the sink.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub workflow_id: Uuid,
    pub workflow_title: String,
    pub notification_type: NotificationType,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// The execution model's only touchpoint with the collaborators
/// described as out of scope in the purpose statement: task creation for
/// the maintainer agent, and user-facing notifications.
#[async_trait]
pub trait CollaboratorSink: Send + Sync + 'static {
    /// Invoked atomically when a handler run reaches `failed:logic` and
    /// `maintenance_fix_count` is still below the configured cap.
    async fn enter_maintenance_mode(&self, workflow_id: Uuid, error: &str);

    /// Invoked when `maintenance_fix_count` exceeds the cap, alongside a
    /// notification of type `escalated`.
    async fn create_task(&self, workflow_id: Uuid, description: &str);

    async fn notify(&self, notification: Notification);
}

/// A [`CollaboratorSink`] that records every call instead of acting on
/// it, for use in tests.
#[derive(Default)]
pub struct RecordingCollaboratorSink {
    pub maintenance_entries: parking_lot::Mutex<Vec<(Uuid, String)>>,
    pub tasks: parking_lot::Mutex<Vec<(Uuid, String)>>,
    pub notifications: parking_lot::Mutex<Vec<Notification>>,
}

impl RecordingCollaboratorSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CollaboratorSink for RecordingCollaboratorSink {
    async fn enter_maintenance_mode(&self, workflow_id: Uuid, error: &str) {
        self.maintenance_entries
            .lock()
            .push((workflow_id, error.to_string()));
    }

    async fn create_task(&self, workflow_id: Uuid, description: &str) {
        self.tasks.lock().push((workflow_id, description.to_string()));
    }

    async fn notify(&self, notification: Notification) {
        self.notifications.lock().push(notification);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recording_sink_captures_every_call() {
        let sink = RecordingCollaboratorSink::new();
        let workflow_id = Uuid::now_v7();

        sink.enter_maintenance_mode(workflow_id, "logic error").await;
        sink.create_task(workflow_id, "fix the script").await;
        sink.notify(Notification {
            workflow_id,
            workflow_title: "test".into(),
            notification_type: NotificationType::Escalated,
            payload: serde_json::json!({}),
            timestamp: Utc::now(),
        })
        .await;

        assert_eq!(sink.maintenance_entries.lock().len(), 1);
        assert_eq!(sink.tasks.lock().len(), 1);
        assert_eq!(sink.notifications.lock().len(), 1);
    }
}
