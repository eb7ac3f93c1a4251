//! Typed view of a workflow's `handler_config` JSON: the declared
//! producer/consumer set the scheduler consults to know which topics a
//! consumer declared and which schedule a producer runs on.
//!
//! The script compiler/runtime that populates `handler_config` from a
//! compiled script body is out of scope; this module only parses the
//! shape the scheduler needs back out of it.

use serde::{Deserialize, Serialize};

use super::ScheduleType;

/// One producer's declared schedule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProducerDeclaration {
    pub name: String,
    pub schedule_type: ScheduleType,
    pub schedule_value: String,
}

/// One consumer's declared topic subscriptions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsumerDeclaration {
    pub name: String,
    #[serde(default)]
    pub topics: Vec<String>,
}

/// The producer/consumer set declared by a workflow's active script,
/// parsed out of [`super::Workflow::handler_config`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct WorkflowHandlerConfig {
    #[serde(default)]
    pub producers: Vec<ProducerDeclaration>,
    #[serde(default)]
    pub consumers: Vec<ConsumerDeclaration>,
}

impl WorkflowHandlerConfig {
    /// Parses `value`, treating anything that doesn't match the expected
    /// shape (including `Value::Null`, the default for a workflow with no
    /// saved script yet) as an empty configuration rather than an error —
    /// the scheduler simply finds no runnable work for such a workflow.
    pub fn from_value(value: &serde_json::Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }

    pub fn consumer(&self, name: &str) -> Option<&ConsumerDeclaration> {
        self.consumers.iter().find(|c| c.name == name)
    }
}
