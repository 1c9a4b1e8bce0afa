use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::SnapshotError;
use crate::ids::AgentId;

/// Resource limits handed to the sandbox with every script run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLimits {
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    pub max_memory_bytes: Option<u64>,
    pub max_output_bytes: usize,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            max_memory_bytes: None,
            max_output_bytes: 256 * 1024,
        }
    }
}

/// Everything the sandbox needs to run one tool script.
#[derive(Clone, Debug)]
pub struct ExecutionRequest {
    pub script_path: PathBuf,
    pub work_dir: PathBuf,
    pub inputs: serde_json::Map<String, serde_json::Value>,
    pub limits: ExecutionLimits,
    pub task_id: AgentId,
    pub workspace_path: Option<PathBuf>,
    pub stable_path: Option<PathBuf>,
    pub node_source: String,
    pub node_metadata: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ExecutionOutcome {
    Success(serde_json::Value),
    Failure(String),
}

impl ExecutionOutcome {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Failure(_))
    }
}

/// Sandboxed tool-script executor.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, request: &ExecutionRequest) -> ExecutionOutcome;

    async fn shutdown(&self) {}
}

/// Result of resuming a suspended script.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResumeOutcome {
    pub suspended: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<serde_json::Value>,
}

/// Pause/resume support for sandboxed scripts.
#[async_trait]
pub trait SnapshotManager: Send + Sync {
    async fn resume_script(
        &self,
        snapshot_id: &str,
        return_value: serde_json::Value,
    ) -> Result<ResumeOutcome, SnapshotError>;

    /// Drop every suspended script owned by `agent_id`.
    async fn cleanup_agent(&self, agent_id: &AgentId);

    async fn clear(&self);
}

/// Serde adapter storing a `Duration` as whole milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}
