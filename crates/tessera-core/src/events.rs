use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AgentId, NodeId, ToolCallId};
use crate::messages::ToolChoice;

/// Stage of processing an event or error belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    Run,
    Model,
    Tool,
    Cleanup,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Run => "run",
            Self::Model => "model",
            Self::Tool => "tool",
            Self::Cleanup => "cleanup",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Started,
    Ok,
    Error,
    Retrying,
    Cancelled,
}

/// Kind-specific payload. Serialized inline with the header under the `event` tag.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventBody {
    NodeStarted {
        operations: Vec<String>,
    },
    NodeCompleted {
        succeeded: usize,
        failed: usize,
        duration_ms: u64,
    },
    AgentStarted {
        task: String,
    },
    AgentCompleted {
        summary: String,
        changed_files: Vec<String>,
        turns: u32,
        duration_ms: u64,
    },
    AgentErrored {
        error: String,
        duration_ms: u64,
    },
    AgentCancelled,
    ModelRequest {
        turn: u32,
        model: String,
        message_count: usize,
        tool_count: usize,
        tool_choice: ToolChoice,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<String>,
    },
    ModelResponse {
        turn: u32,
        duration_ms: u64,
        prompt_tokens: u32,
        completion_tokens: u32,
        total_tokens: u32,
        tool_call_count: usize,
        response_preview: String,
    },
    ModelRetry {
        attempt: u32,
        max_attempts: u32,
        delay_ms: u64,
        error: String,
    },
    ToolCall {
        call_id: ToolCallId,
        tool_name: String,
        arguments_preview: String,
    },
    ToolResult {
        call_id: ToolCallId,
        tool_name: String,
        duration_ms: u64,
        is_error: bool,
        output_preview: String,
    },
}

impl EventBody {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::NodeStarted { .. } => EventKind::NodeStarted,
            Self::NodeCompleted { .. } => EventKind::NodeCompleted,
            Self::AgentStarted { .. } => EventKind::AgentStarted,
            Self::AgentCompleted { .. } => EventKind::AgentCompleted,
            Self::AgentErrored { .. } => EventKind::AgentErrored,
            Self::AgentCancelled => EventKind::AgentCancelled,
            Self::ModelRequest { .. } => EventKind::ModelRequest,
            Self::ModelResponse { .. } => EventKind::ModelResponse,
            Self::ModelRetry { .. } => EventKind::ModelRetry,
            Self::ToolCall { .. } => EventKind::ToolCall,
            Self::ToolResult { .. } => EventKind::ToolResult,
        }
    }

    fn default_phase(&self) -> Phase {
        match self {
            Self::NodeStarted { .. } => Phase::Init,
            Self::NodeCompleted { .. }
            | Self::AgentStarted { .. }
            | Self::AgentCompleted { .. }
            | Self::AgentErrored { .. }
            | Self::AgentCancelled => Phase::Run,
            Self::ModelRequest { .. } | Self::ModelResponse { .. } | Self::ModelRetry { .. } => {
                Phase::Model
            }
            Self::ToolCall { .. } | Self::ToolResult { .. } => Phase::Tool,
        }
    }

    fn default_status(&self) -> EventStatus {
        match self {
            Self::NodeStarted { .. }
            | Self::AgentStarted { .. }
            | Self::ModelRequest { .. }
            | Self::ToolCall { .. } => EventStatus::Started,
            Self::NodeCompleted { failed, .. } if *failed > 0 => EventStatus::Error,
            Self::AgentErrored { .. } => EventStatus::Error,
            Self::ToolResult { is_error: true, .. } => EventStatus::Error,
            Self::AgentCancelled => EventStatus::Cancelled,
            Self::ModelRetry { .. } => EventStatus::Retrying,
            _ => EventStatus::Ok,
        }
    }
}

/// An immutable fact emitted on the bus.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub agent_id: Option<AgentId>,
    pub node_id: Option<NodeId>,
    pub operation: Option<String>,
    pub phase: Phase,
    pub status: EventStatus,
    #[serde(flatten)]
    pub body: EventBody,
}

impl Event {
    pub fn new(body: EventBody) -> Self {
        Self {
            timestamp: Utc::now(),
            agent_id: None,
            node_id: None,
            operation: None,
            phase: body.default_phase(),
            status: body.default_status(),
            body,
        }
    }

    pub fn with_agent(mut self, agent_id: AgentId) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    pub fn with_node(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn with_status(mut self, status: EventStatus) -> Self {
        self.status = status;
        self
    }

    pub fn kind(&self) -> EventKind {
        self.body.kind()
    }

    pub fn event_type(&self) -> &'static str {
        self.kind().as_str()
    }
}

/// Subscription key. Leaf kinds name one event; group kinds match all their members.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Any,
    Node,
    Agent,
    Model,
    Tool,
    NodeStarted,
    NodeCompleted,
    AgentStarted,
    AgentCompleted,
    AgentErrored,
    AgentCancelled,
    ModelRequest,
    ModelResponse,
    ModelRetry,
    ToolCall,
    ToolResult,
}

impl EventKind {
    pub fn parent(&self) -> Option<EventKind> {
        match self {
            Self::Any => None,
            Self::Node | Self::Agent | Self::Model | Self::Tool => Some(Self::Any),
            Self::NodeStarted | Self::NodeCompleted => Some(Self::Node),
            Self::AgentStarted
            | Self::AgentCompleted
            | Self::AgentErrored
            | Self::AgentCancelled => Some(Self::Agent),
            Self::ModelRequest | Self::ModelResponse | Self::ModelRetry => Some(Self::Model),
            Self::ToolCall | Self::ToolResult => Some(Self::Tool),
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, Self::Any | Self::Node | Self::Agent | Self::Model | Self::Tool)
    }

    /// True when a subscription to `self` should receive an event of kind `event`.
    pub fn matches(&self, event: EventKind) -> bool {
        let mut current = Some(event);
        while let Some(kind) = current {
            if kind == *self {
                return true;
            }
            current = kind.parent();
        }
        false
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::Node => "node",
            Self::Agent => "agent",
            Self::Model => "model",
            Self::Tool => "tool",
            Self::NodeStarted => "node_started",
            Self::NodeCompleted => "node_completed",
            Self::AgentStarted => "agent_started",
            Self::AgentCompleted => "agent_completed",
            Self::AgentErrored => "agent_errored",
            Self::AgentCancelled => "agent_cancelled",
            Self::ModelRequest => "model_request",
            Self::ModelResponse => "model_response",
            Self::ModelRetry => "model_retry",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives events from the bus. Errors are logged by the bus and never propagate.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> anyhow::Result<()>;

    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool_result(is_error: bool) -> Event {
        Event::new(EventBody::ToolResult {
            call_id: ToolCallId::from_raw("call_1"),
            tool_name: "lint".into(),
            duration_ms: 3,
            is_error,
            output_preview: "ok".into(),
        })
    }

    #[test]
    fn serializes_flat_with_event_tag() {
        let evt = tool_result(false)
            .with_agent(AgentId::from_raw("agent_1"))
            .with_node(NodeId::new("n1"))
            .with_operation("lint");
        let json = serde_json::to_value(&evt).unwrap();
        assert_eq!(json["event"], "tool_result");
        assert_eq!(json["agent_id"], "agent_1");
        assert_eq!(json["node_id"], "n1");
        assert_eq!(json["operation"], "lint");
        assert_eq!(json["phase"], "tool");
        assert_eq!(json["status"], "ok");
        assert_eq!(json["tool_name"], "lint");
        assert!(json.get("timestamp").is_some());

        let parsed: Event = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, evt);
    }

    #[test]
    fn status_follows_body() {
        assert_eq!(tool_result(true).status, EventStatus::Error);
        assert_eq!(Event::new(EventBody::AgentCancelled).status, EventStatus::Cancelled);
        let retry = Event::new(EventBody::ModelRetry {
            attempt: 1,
            max_attempts: 3,
            delay_ms: 100,
            error: "reset".into(),
        });
        assert_eq!(retry.status, EventStatus::Retrying);
        assert_eq!(retry.phase, Phase::Model);
    }

    #[test]
    fn group_kinds_match_members() {
        assert!(EventKind::Tool.matches(EventKind::ToolResult));
        assert!(EventKind::Any.matches(EventKind::NodeStarted));
        assert!(EventKind::ModelRetry.matches(EventKind::ModelRetry));
        assert!(!EventKind::Model.matches(EventKind::ToolCall));
        assert!(!EventKind::ToolCall.matches(EventKind::Tool));
    }

    #[test]
    fn every_leaf_reaches_any() {
        let leaves = [
            EventKind::NodeStarted,
            EventKind::NodeCompleted,
            EventKind::AgentStarted,
            EventKind::AgentCompleted,
            EventKind::AgentErrored,
            EventKind::AgentCancelled,
            EventKind::ModelRequest,
            EventKind::ModelResponse,
            EventKind::ModelRetry,
            EventKind::ToolCall,
            EventKind::ToolResult,
        ];
        for kind in leaves {
            assert!(!kind.is_group());
            assert!(EventKind::Any.matches(kind), "{kind} not under any");
        }
    }

    #[test]
    fn event_type_str() {
        assert_eq!(Event::new(EventBody::AgentCancelled).event_type(), "agent_cancelled");
    }
}
