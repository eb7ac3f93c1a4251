//! The `ProducerSchedule` entity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How a producer's `schedule_value` should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    /// `schedule_value` is a simple duration expression (`"5m"`, `"1h"`).
    Interval,
    /// `schedule_value` is a standard 5-field cron expression, evaluated
    /// in UTC.
    Cron,
}

/// Per-(workflow, producer_name) scheduling record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProducerSchedule {
    pub workflow_id: Uuid,
    pub producer_name: String,
    pub schedule_type: ScheduleType,
    pub schedule_value: String,
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
}

impl ProducerSchedule {
    pub fn new(
        workflow_id: Uuid,
        producer_name: impl Into<String>,
        schedule_type: ScheduleType,
        schedule_value: impl Into<String>,
        first_run_at: DateTime<Utc>,
    ) -> Self {
        Self {
            workflow_id,
            producer_name: producer_name.into(),
            schedule_type,
            schedule_value: schedule_value.into(),
            next_run_at: first_run_at,
            last_run_at: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_run_at <= now
    }
}
