use std::path::PathBuf;
use std::time::Duration;

/// Errors raised by a chat-completion client.
/// Connection failures and timeouts are retryable; everything else is not.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("client closed")]
    Closed,
}

impl ClientError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_))
    }

    /// Short classification string for logging and events.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::Timeout(_) => "timeout",
            Self::Status { .. } => "status",
            Self::InvalidResponse(_) => "invalid_response",
            Self::Closed => "closed",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("failed to open workspace for {task_id}: {reason}")]
    Open { task_id: String, reason: String },
    #[error("failed to close workspace {path}: {reason}")]
    Close { path: PathBuf, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot not found: {0}")]
    NotFound(String),
    #[error("resume failed: {0}")]
    ResumeFailed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("no bundle configured for operation '{0}'")]
    UnknownOperation(String),
    #[error("failed to read bundle {path}: {reason}")]
    Read { path: PathBuf, reason: String },
    #[error("invalid bundle {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
}
