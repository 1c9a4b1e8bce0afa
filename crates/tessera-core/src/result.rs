use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::events::Phase;
use crate::ids::{AgentId, NodeId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Success,
    Failed,
    Skipped,
}

/// Final outcome of one agent task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub status: AgentStatus,
    pub task_id: AgentId,
    #[serde(default)]
    pub changed_files: Vec<String>,
    pub summary: String,
    #[serde(default)]
    pub details: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentResult {
    pub fn success(task_id: AgentId, summary: impl Into<String>) -> Self {
        Self {
            status: AgentStatus::Success,
            task_id,
            changed_files: Vec::new(),
            summary: summary.into(),
            details: serde_json::Map::new(),
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == AgentStatus::Success
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperationError {
    pub operation: String,
    pub phase: Phase,
    pub error: String,
}

/// Everything that happened for one node across its operations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    pub node_id: NodeId,
    pub operations: BTreeMap<String, AgentResult>,
    pub errors: Vec<OperationError>,
}

impl NodeResult {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            operations: BTreeMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// How a task ended. Cancellation is an outcome, not an error.
#[derive(Clone, Debug, PartialEq)]
pub enum TaskOutcome {
    Completed(AgentResult),
    Cancelled,
}
