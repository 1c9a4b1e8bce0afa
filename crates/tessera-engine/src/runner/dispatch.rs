use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use tessera_core::definition::{SubagentDefinition, ToolDefinition};
use tessera_core::events::EventBody;
use tessera_core::executor::{
    ExecutionLimits, ExecutionOutcome, ExecutionRequest, SnapshotManager, ToolExecutor,
};
use tessera_core::ids::AgentId;
use tessera_core::messages::{ToolCall, ToolSchema};
use tessera_core::node::CodeNode;
use tessera_core::workspace::Workspace;

use crate::bus::ScopedEmitter;
use crate::truncate::{preview, truncate_output, PREVIEW_CHARS};

pub const RESUME_SCRIPT_TOOL: &str = "resume_script";

/// Result of one tool call as fed back to the model.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// Routes model tool calls to sandboxed scripts. Never fails: every problem
/// becomes an error result for the model to see.
pub struct ToolDispatcher {
    definition: Arc<SubagentDefinition>,
    node: Arc<CodeNode>,
    agent_id: AgentId,
    workspace: Option<Workspace>,
    executor: Arc<dyn ToolExecutor>,
    snapshots: Option<Arc<dyn SnapshotManager>>,
    emitter: ScopedEmitter,
    limits: ExecutionLimits,
    max_output: usize,
}

impl ToolDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        definition: Arc<SubagentDefinition>,
        node: Arc<CodeNode>,
        agent_id: AgentId,
        workspace: Option<Workspace>,
        executor: Arc<dyn ToolExecutor>,
        snapshots: Option<Arc<dyn SnapshotManager>>,
        emitter: ScopedEmitter,
        limits: ExecutionLimits,
        max_output: usize,
    ) -> Self {
        Self {
            definition,
            node,
            agent_id,
            workspace,
            executor,
            snapshots,
            emitter,
            limits,
            max_output,
        }
    }

    /// Schemas advertised to the model. `resume_script` only when snapshots are enabled.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas = self.definition.tool_schemas();
        if self.snapshots.is_some() && self.definition.tool(RESUME_SCRIPT_TOOL).is_none() {
            schemas.push(resume_script_schema());
        }
        schemas
    }

    pub async fn dispatch(&self, call: &ToolCall) -> ToolOutput {
        self.emitter
            .emit(EventBody::ToolCall {
                call_id: call.id.clone(),
                tool_name: call.name.clone(),
                arguments_preview: preview(&call.arguments, PREVIEW_CHARS),
            })
            .await;

        let start = Instant::now();
        let output = self.execute_call(call).await;
        let output = ToolOutput {
            content: truncate_output(&output.content, self.max_output),
            is_error: output.is_error,
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        if output.is_error {
            debug!(tool = %call.name, duration_ms, "tool call failed");
        }
        self.emitter
            .emit(EventBody::ToolResult {
                call_id: call.id.clone(),
                tool_name: call.name.clone(),
                duration_ms,
                is_error: output.is_error,
                output_preview: preview(&output.content, PREVIEW_CHARS),
            })
            .await;
        output
    }

    async fn execute_call(&self, call: &ToolCall) -> ToolOutput {
        let args = match parse_arguments(&call.arguments) {
            Ok(args) => args,
            Err(msg) => return ToolOutput::error(format!("Invalid arguments for {}: {msg}", call.name)),
        };

        if let Some(tool) = self.definition.tool(&call.name) {
            return self.run_tool(tool, args).await;
        }
        if call.name == RESUME_SCRIPT_TOOL {
            return self.resume_script(args).await;
        }
        ToolOutput::error(format!("Unknown tool: {}", call.name))
    }

    async fn run_tool(&self, tool: &ToolDefinition, args: Map<String, Value>) -> ToolOutput {
        let Some(script) = &tool.script else {
            return ToolOutput::error(format!("Tool {} has no script", tool.name));
        };

        let mut inputs = self.base_inputs();
        inputs.extend(args);

        let mut sections = Vec::with_capacity(tool.context_providers.len() + 1);
        for provider in &tool.context_providers {
            match self.executor.execute(&self.request(provider.clone(), inputs.clone())).await {
                ExecutionOutcome::Success(value) => sections.push(render_value(&value)),
                ExecutionOutcome::Failure(msg) => {
                    warn!(
                        tool = %tool.name,
                        provider = %provider.display(),
                        error = %msg,
                        "context provider failed"
                    );
                    return ToolOutput::error(msg);
                }
            }
        }

        match self.executor.execute(&self.request(script.clone(), inputs)).await {
            ExecutionOutcome::Success(value) => {
                sections.push(render_value(&value));
                ToolOutput::ok(
                    sections
                        .into_iter()
                        .filter(|s| !s.is_empty())
                        .collect::<Vec<_>>()
                        .join("\n"),
                )
            }
            ExecutionOutcome::Failure(msg) => ToolOutput::error(msg),
        }
    }

    async fn resume_script(&self, args: Map<String, Value>) -> ToolOutput {
        let Some(snapshots) = &self.snapshots else {
            let body = serde_json::json!({
                "error": "snapshots_disabled",
                "message": "Script snapshots are not enabled for this run; resume_script is unavailable.",
            });
            return ToolOutput::ok(body.to_string());
        };

        let Some(snapshot_id) = args.get("snapshot_id").and_then(Value::as_str) else {
            return ToolOutput::error("resume_script requires a string 'snapshot_id'");
        };
        let return_value = args.get("return_value").cloned().unwrap_or(Value::Null);

        match snapshots.resume_script(snapshot_id, return_value).await {
            Ok(outcome) => match serde_json::to_string(&outcome) {
                Ok(json) => ToolOutput::ok(json),
                Err(e) => ToolOutput::error(format!("failed to encode resume result: {e}")),
            },
            Err(e) => ToolOutput::error(e.to_string()),
        }
    }

    fn base_inputs(&self) -> Map<String, Value> {
        let mut inputs = Map::new();
        inputs.insert("node_text".into(), Value::String(self.node.text.clone()));
        inputs.insert(
            "target_file".into(),
            Value::String(self.node.file_path.to_string_lossy().into_owned()),
        );
        inputs.insert("task_id".into(), Value::String(self.agent_id.to_string()));
        inputs.insert("node_name".into(), Value::String(self.node.name.clone()));
        inputs.insert("node_type".into(), Value::String(self.node.kind.as_str().into()));
        inputs
    }

    fn request(&self, script_path: PathBuf, inputs: Map<String, Value>) -> ExecutionRequest {
        let work_dir = self
            .workspace
            .as_ref()
            .map(|w| w.path.clone())
            .unwrap_or_else(|| self.definition.bundle_dir.clone());
        ExecutionRequest {
            script_path,
            work_dir,
            inputs,
            limits: self.limits.clone(),
            task_id: self.agent_id.clone(),
            workspace_path: self.workspace.as_ref().map(|w| w.path.clone()),
            stable_path: self.workspace.as_ref().and_then(|w| w.stable_path.clone()),
            node_source: self.node.text.clone(),
            node_metadata: self.node.metadata(),
        }
    }
}

fn parse_arguments(raw: &str) -> Result<Map<String, Value>, String> {
    if raw.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(format!("expected a JSON object, got {}", json_type(&other))),
        Err(e) => Err(e.to_string()),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn resume_script_schema() -> ToolSchema {
    ToolSchema {
        name: RESUME_SCRIPT_TOOL.into(),
        description: "Resume a suspended tool script, passing the value its pending call should return."
            .into(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "snapshot_id": {"type": "string", "description": "Id reported by the suspended script"},
                "return_value": {"description": "Value returned to the suspended call"}
            },
            "required": ["snapshot_id"]
        }),
    }
}
