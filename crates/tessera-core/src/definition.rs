use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::messages::ToolSchema;
use crate::node::CodeNode;

pub const DEFAULT_TERMINATION_TOOL: &str = "submit_result";
pub const DEFAULT_MAX_TURNS: u32 = 10;

fn default_parameters() -> serde_json::Value {
    serde_json::json!({"type": "object", "properties": {}})
}

fn default_termination_tool() -> String {
    DEFAULT_TERMINATION_TOOL.to_string()
}

fn default_max_turns() -> u32 {
    DEFAULT_MAX_TURNS
}

/// One entry of an operation's tool catalog.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_parameters")]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub script: Option<PathBuf>,
    /// Scripts run before the tool; their output is prepended to the tool's.
    #[serde(default)]
    pub context_providers: Vec<PathBuf>,
}

impl ToolDefinition {
    pub fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

/// Everything one operation needs to run against a node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubagentDefinition {
    pub name: String,
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub node_context: String,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    #[serde(default = "default_termination_tool")]
    pub termination_tool: String,
    #[serde(default)]
    pub bundle_dir: PathBuf,
}

impl SubagentDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tools: Vec::new(),
            system_prompt: String::new(),
            node_context: String::new(),
            max_turns: DEFAULT_MAX_TURNS,
            termination_tool: default_termination_tool(),
            bundle_dir: PathBuf::new(),
        }
    }

    pub fn tool(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.iter().find(|t| t.name == name)
    }

    /// Catalog schemas, plus a default termination schema when the catalog lacks one.
    pub fn tool_schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self.tools.iter().map(ToolDefinition::schema).collect();
        if self.tool(&self.termination_tool).is_none() {
            schemas.push(termination_schema(&self.termination_tool));
        }
        schemas
    }

    /// Resolve relative script paths against `bundle_dir`.
    pub fn resolve_paths(&mut self, bundle_dir: &Path) {
        self.bundle_dir = bundle_dir.to_path_buf();
        for tool in &mut self.tools {
            if let Some(script) = tool.script.as_mut() {
                if script.is_relative() {
                    *script = bundle_dir.join(&*script);
                }
            }
            for provider in &mut tool.context_providers {
                if provider.is_relative() {
                    *provider = bundle_dir.join(&*provider);
                }
            }
        }
    }

    /// Fill the `node_context` template for `node`.
    pub fn render_node_context(&self, node: &CodeNode) -> String {
        let file_path = node.file_path.to_string_lossy();
        let replacements: [(&str, &str); 5] = [
            ("node_text", node.text.as_str()),
            ("node_name", node.name.as_str()),
            ("node_type", node.kind.as_str()),
            ("file_path", file_path.as_ref()),
            ("node_id", node.id.as_str()),
        ];
        let mut out = self.node_context.clone();
        for (key, value) in replacements {
            out = out.replace(&format!("{{{{ {key} }}}}"), value);
            out = out.replace(&format!("{{{{{key}}}}}"), value);
        }
        out
    }
}

/// Schema advertised for the termination tool when a bundle does not define one.
pub fn termination_schema(name: &str) -> ToolSchema {
    ToolSchema {
        name: name.to_string(),
        description: "Submit the final result of this task.".to_string(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "summary": {"type": "string", "description": "What was done"},
                "changed_files": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Paths of files modified"
                },
                "details": {"type": "object", "description": "Additional structured output"}
            },
            "required": ["summary"]
        }),
    }
}
