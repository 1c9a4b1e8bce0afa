//! Fakes shared by the engine's unit tests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use tessera_core::definition::{SubagentDefinition, ToolDefinition};
use tessera_core::errors::{SnapshotError, WorkspaceError};
use tessera_core::events::{Event, EventHandler, EventKind};
use tessera_core::executor::{
    ExecutionOutcome, ExecutionRequest, ResumeOutcome, SnapshotManager, ToolExecutor,
};
use tessera_core::ids::{AgentId, NodeId};
use tessera_core::node::{CodeNode, NodeKind};
use tessera_core::workspace::{Workspace, WorkspaceService};

#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<Event>>,
}

impl RecordingHandler {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().iter().map(Event::kind).collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeWorkspaces {
    open_delay: Option<Duration>,
    fail: bool,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

impl FakeWorkspaces {
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = Some(delay);
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkspaceService for FakeWorkspaces {
    async fn open(&self, task_id: &AgentId) -> Result<Workspace, WorkspaceError> {
        if let Some(delay) = self.open_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(WorkspaceError::Open {
                task_id: task_id.to_string(),
                reason: "overlay unavailable".into(),
            });
        }
        let n = self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Workspace {
            task_id: task_id.clone(),
            path: PathBuf::from(format!("/fake/{task_id}/{n}")),
            stable_path: None,
        })
    }

    async fn close(&self, _workspace: &Workspace) -> Result<(), WorkspaceError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Executor answering per script path; unknown scripts succeed with `"ok"`.
#[derive(Default)]
pub struct FakeExecutor {
    results: HashMap<PathBuf, ExecutionOutcome>,
    panics: Vec<PathBuf>,
    calls: Mutex<Vec<ExecutionRequest>>,
    shutdowns: AtomicUsize,
}

impl FakeExecutor {
    pub fn with_result(mut self, script: &str, outcome: ExecutionOutcome) -> Self {
        self.results.insert(PathBuf::from(script), outcome);
        self
    }

    pub fn with_panic(mut self, script: &str) -> Self {
        self.panics.push(PathBuf::from(script));
        self
    }

    pub fn calls(&self) -> Vec<ExecutionRequest> {
        self.calls.lock().clone()
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolExecutor for FakeExecutor {
    async fn execute(&self, request: &ExecutionRequest) -> ExecutionOutcome {
        self.calls.lock().push(request.clone());
        if self.panics.contains(&request.script_path) {
            panic!("script crashed: {}", request.script_path.display());
        }
        self.results
            .get(&request.script_path)
            .cloned()
            .unwrap_or_else(|| ExecutionOutcome::Success(Value::String("ok".into())))
    }

    async fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

/// Knows exactly one snapshot, `s1`, which completes with the value it is given.
#[derive(Default)]
pub struct FakeSnapshots {
    cleaned_up: AtomicUsize,
    clears: AtomicUsize,
    panic_on_cleanup: bool,
}

impl FakeSnapshots {
    pub fn panicking_cleanup(mut self) -> Self {
        self.panic_on_cleanup = true;
        self
    }

    pub fn cleaned_up(&self) -> usize {
        self.cleaned_up.load(Ordering::SeqCst)
    }

    pub fn clears(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotManager for FakeSnapshots {
    async fn resume_script(
        &self,
        snapshot_id: &str,
        return_value: Value,
    ) -> Result<ResumeOutcome, SnapshotError> {
        if snapshot_id != "s1" {
            return Err(SnapshotError::NotFound(snapshot_id.to_string()));
        }
        Ok(ResumeOutcome {
            suspended: false,
            snapshot_id: None,
            result: Some(return_value),
            pending: None,
        })
    }

    async fn cleanup_agent(&self, agent_id: &AgentId) {
        if self.panic_on_cleanup {
            panic!("snapshot cleanup failed for {}", agent_id.as_str());
        }
        self.cleaned_up.fetch_add(1, Ordering::SeqCst);
    }

    async fn clear(&self) {
        self.clears.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn sample_node(id: &str) -> CodeNode {
    let text = "def handler(event):\n    return event\n".to_string();
    CodeNode {
        id: NodeId::new(id),
        kind: NodeKind::Function,
        name: "handler".into(),
        file_path: PathBuf::from("src/app.py"),
        start_byte: 0,
        end_byte: text.len(),
        start_line: 1,
        end_line: 2,
        text,
    }
}

/// One `run_lint` tool backed by `/bundles/lint/run_lint.pym`.
pub fn lint_definition() -> SubagentDefinition {
    let mut def = SubagentDefinition::new("lint");
    def.system_prompt = "You lint Python functions.".into();
    def.bundle_dir = PathBuf::from("/bundles/lint");
    def.tools.push(ToolDefinition {
        name: "run_lint".into(),
        description: "Run the linter on the node".into(),
        parameters: serde_json::json!({"type": "object", "properties": {}}),
        script: Some(PathBuf::from("/bundles/lint/run_lint.pym")),
        context_providers: Vec::new(),
    });
    def
}
