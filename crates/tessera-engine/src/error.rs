use std::time::Duration;

use tessera_core::context::TransitionError;
use tessera_core::errors::{ClientError, WorkspaceError};
use tessera_core::ids::NodeId;

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("model '{0}' cannot be resolved by the chat client")]
    ModelUnavailable(String),

    #[error("model unreachable after {attempts} attempts: {last_error}")]
    ModelUnreachable { attempts: u32, last_error: ClientError },

    #[error("invalid submission: {0}")]
    InvalidSubmission(String),

    #[error("model answered without calling a tool on turn {turn} while a tool call was required")]
    NoTerminationCall { turn: u32 },

    #[error("turn limit exceeded: {0}")]
    TurnLimitExceeded(u32),

    #[error("client error: {0}")]
    Client(#[from] ClientError),
}

/// Failure of one coordinator task, recorded against its operation.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("task cleanup panicked: {0}")]
    CleanupPanicked(String),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("cycle detected among {} nodes", remaining.len())]
    CycleDetected { remaining: Vec<NodeId> },

    #[error("deadlock: no ready nodes while {} remain", remaining.len())]
    Deadlock { remaining: Vec<NodeId> },

    #[error("duplicate node id {0}")]
    DuplicateNode(NodeId),

    #[error("node {node} references unknown node {dependency}")]
    UnknownDependency { node: NodeId, dependency: NodeId },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BusError {
    #[error("timed out after {0:?} waiting for event")]
    Timeout(Duration),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv { var: String, value: String },
}
