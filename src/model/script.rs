//! The `Script` entity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who authored a script version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptType {
    /// Authored by the planner agent; bumps major version, resets minor.
    Planner,
    /// Authored by the maintainer agent in response to a logic failure;
    /// bumps minor version only.
    Maintainer,
}

/// One version of the code for a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Script {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub major_version: u32,
    pub minor_version: u32,
    pub code: String,
    pub handler_config: serde_json::Value,
    pub summary: String,
    pub diagram: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub change_comment: String,
    pub script_type: ScriptType,
}

impl Script {
    /// Builds the next script version following the bump rule for
    /// `script_type` relative to `previous` (`None` for the first script
    /// of a workflow, which is always major_version=1, minor_version=0).
    pub fn next_version(
        workflow_id: Uuid,
        previous: Option<&Script>,
        script_type: ScriptType,
        code: impl Into<String>,
        handler_config: serde_json::Value,
        summary: impl Into<String>,
        change_comment: impl Into<String>,
    ) -> Self {
        let (major_version, minor_version) = match (previous, script_type) {
            (None, _) => (1, 0),
            (Some(prev), ScriptType::Planner) => (prev.major_version + 1, 0),
            (Some(prev), ScriptType::Maintainer) => (prev.major_version, prev.minor_version + 1),
        };
        Self {
            id: super::new_id(),
            workflow_id,
            major_version,
            minor_version,
            code: code.into(),
            handler_config,
            summary: summary.into(),
            diagram: None,
            timestamp: Utc::now(),
            change_comment: change_comment.into(),
            script_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_script_is_one_zero() {
        let s = Script::next_version(
            Uuid::now_v7(),
            None,
            ScriptType::Planner,
            "",
            serde_json::Value::Null,
            "",
            "",
        );
        assert_eq!((s.major_version, s.minor_version), (1, 0));
    }

    #[test]
    fn planner_bumps_major_resets_minor() {
        let workflow_id = Uuid::now_v7();
        let first = Script::next_version(
            workflow_id,
            None,
            ScriptType::Maintainer,
            "",
            serde_json::Value::Null,
            "",
            "",
        );
        let second = Script::next_version(
            workflow_id,
            Some(&first),
            ScriptType::Planner,
            "",
            serde_json::Value::Null,
            "",
            "",
        );
        assert_eq!((second.major_version, second.minor_version), (2, 0));
    }

    #[test]
    fn maintainer_bumps_minor_only() {
        let workflow_id = Uuid::now_v7();
        let first = Script::next_version(
            workflow_id,
            None,
            ScriptType::Planner,
            "",
            serde_json::Value::Null,
            "",
            "",
        );
        let second = Script::next_version(
            workflow_id,
            Some(&first),
            ScriptType::Maintainer,
            "",
            serde_json::Value::Null,
            "",
            "",
        );
        assert_eq!((second.major_version, second.minor_version), (1, 1));
    }
}
