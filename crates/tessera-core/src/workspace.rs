use std::path::PathBuf;

use async_trait::async_trait;

use crate::errors::WorkspaceError;
use crate::ids::AgentId;

/// A task-private view of the file tree where edits are staged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Workspace {
    pub task_id: AgentId,
    pub path: PathBuf,
    /// Read-only project root the workspace overlays, if any.
    pub stable_path: Option<PathBuf>,
}

#[async_trait]
pub trait WorkspaceService: Send + Sync {
    async fn open(&self, task_id: &AgentId) -> Result<Workspace, WorkspaceError>;

    async fn close(&self, workspace: &Workspace) -> Result<(), WorkspaceError>;
}
