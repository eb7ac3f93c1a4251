//! Configuration surfaces for the execution model.
//!
//! This crate accepts already-typed configuration rather than parsing
//! environment variables itself; the embedding binary owns that.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::reliability::RetryPolicy;

/// Tuning for the scheduler and the handler lifecycle it drives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of maintainer cycles a workflow is allowed before it is
    /// forced into `status='error'`.
    pub maintenance_cap: u32,

    /// Lower bound a consumer's requested `wake_at` is clamped to.
    #[serde(with = "duration_millis")]
    pub wake_at_min: Duration,

    /// Upper bound a consumer's requested `wake_at` is clamped to.
    #[serde(with = "duration_millis")]
    pub wake_at_max: Duration,

    /// Backoff schedule for handler-run transient retries.
    pub handler_retry_policy: RetryPolicy,

    /// Backoff schedule for mutation reconciliation polling.
    pub reconciliation_retry_policy: RetryPolicy,

    /// Soft timeout for one handler run before it is failed as
    /// `failed:internal`.
    #[serde(with = "duration_millis")]
    pub session_soft_timeout: Duration,

    /// Per-run cost cap, in microdollars. Zero means uncapped.
    pub cost_cap_micros: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            maintenance_cap: 3,
            wake_at_min: Duration::from_secs(30),
            wake_at_max: Duration::from_secs(24 * 60 * 60),
            handler_retry_policy: RetryPolicy::exponential(),
            reconciliation_retry_policy: RetryPolicy::reconciliation(),
            session_soft_timeout: Duration::from_secs(300),
            cost_cap_micros: 0,
        }
    }
}

impl SchedulerConfig {
    pub fn with_maintenance_cap(mut self, cap: u32) -> Self {
        self.maintenance_cap = cap;
        self
    }

    pub fn with_wake_at_bounds(mut self, min: Duration, max: Duration) -> Self {
        self.wake_at_min = min;
        self.wake_at_max = max;
        self
    }
}

/// Connection and pooling surface for the backing store. Only meaningful
/// for [`crate::store::PostgresStore`]; the in-memory store ignores it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub database_url: String,
    pub max_connections: u32,
    #[serde(with = "duration_millis")]
    pub connect_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            max_connections: 10,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = SchedulerConfig::default();
        assert_eq!(config.maintenance_cap, 3);
        assert_eq!(config.wake_at_min, Duration::from_secs(30));
        assert_eq!(config.wake_at_max, Duration::from_secs(24 * 60 * 60));
    }

    #[test]
    fn scheduler_config_serializes_durations_as_millis() {
        let config = SchedulerConfig::default();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["wake_at_min"], serde_json::json!(30_000));
    }
}
