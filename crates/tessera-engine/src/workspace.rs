use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, warn};

use tessera_core::errors::WorkspaceError;
use tessera_core::ids::AgentId;
use tessera_core::workspace::{Workspace, WorkspaceService};

/// Open workspaces keyed by task id.
pub struct WorkspaceCache {
    service: Arc<dyn WorkspaceService>,
    open: DashMap<AgentId, Workspace>,
}

impl WorkspaceCache {
    pub fn new(service: Arc<dyn WorkspaceService>) -> Self {
        Self {
            service,
            open: DashMap::new(),
        }
    }

    /// Reuse the task's open workspace or open a new one.
    /// When two opens race, the loser is closed and the cached handle returned.
    pub async fn get_or_open(&self, task_id: &AgentId) -> Result<Workspace, WorkspaceError> {
        if let Some(ws) = self.open.get(task_id) {
            return Ok(ws.clone());
        }

        let opened = self.service.open(task_id).await?;
        let existing = match self.open.entry(task_id.clone()) {
            Entry::Occupied(e) => Some(e.get().clone()),
            Entry::Vacant(v) => {
                v.insert(opened.clone());
                None
            }
        };

        match existing {
            Some(ws) => {
                debug!(task_id = %task_id, "lost workspace open race, closing duplicate");
                if let Err(e) = self.service.close(&opened).await {
                    warn!(task_id = %task_id, error = %e, "failed to close duplicate workspace");
                }
                Ok(ws)
            }
            None => Ok(opened),
        }
    }

    /// Remove and close the task's workspace. Unknown tasks are a no-op.
    pub async fn release(&self, task_id: &AgentId) -> Result<(), WorkspaceError> {
        let Some((_, ws)) = self.open.remove(task_id) else {
            return Ok(());
        };
        self.service.close(&ws).await
    }

    /// Close every open workspace. Returns how many were closed cleanly.
    pub async fn close_all(&self) -> usize {
        let ids: Vec<AgentId> = self.open.iter().map(|e| e.key().clone()).collect();
        let mut closed = 0;
        for id in ids {
            match self.release(&id).await {
                Ok(()) => closed += 1,
                Err(e) => warn!(task_id = %id, error = %e, "failed to close workspace"),
            }
        }
        closed
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }
}

/// Plain directory per task under `root`. Removed on close.
pub struct DirectoryWorkspaces {
    root: PathBuf,
    stable_path: Option<PathBuf>,
}

impl DirectoryWorkspaces {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            stable_path: None,
        }
    }

    /// Project root exposed read-only to tools alongside the task directory.
    pub fn with_stable_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.stable_path = Some(path.into());
        self
    }
}

#[async_trait]
impl WorkspaceService for DirectoryWorkspaces {
    async fn open(&self, task_id: &AgentId) -> Result<Workspace, WorkspaceError> {
        let path = self.root.join(task_id.as_str());
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| WorkspaceError::Open {
                task_id: task_id.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Workspace {
            task_id: task_id.clone(),
            path,
            stable_path: self.stable_path.clone(),
        })
    }

    async fn close(&self, workspace: &Workspace) -> Result<(), WorkspaceError> {
        match tokio::fs::remove_dir_all(&workspace.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(WorkspaceError::Close {
                path: workspace.path.clone(),
                reason: e.to_string(),
            }),
        }
    }
}
