use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AgentId, NodeId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Queued,
    Executing,
    Completed,
    Errored,
}

impl AgentState {
    pub fn can_transition_to(&self, next: AgentState) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Executing)
                | (Self::Queued, Self::Errored)
                | (Self::Executing, Self::Completed)
                | (Self::Executing, Self::Errored)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Errored)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid transition for {agent_id}: {from:?} -> {to:?}")]
pub struct TransitionError {
    pub agent_id: AgentId,
    pub from: AgentState,
    pub to: AgentState,
}

/// Lifecycle record of one node x operation task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentContext {
    pub agent_id: AgentId,
    pub task: String,
    pub operation: String,
    pub node_id: NodeId,
    state: AgentState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentContext {
    pub fn new(node_id: NodeId, operation: impl Into<String>, task: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            agent_id: AgentId::new(),
            task: task.into(),
            operation: operation.into(),
            node_id,
            state: AgentState::Queued,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn transition(&mut self, next: AgentState) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                agent_id: self.agent_id.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}
