use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use tessera_core::events::{Event, EventHandler, EventStatus};

use crate::TelemetryError;

/// Appends every event it receives to a file, one JSON object per line.
pub struct JsonLinesSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesSink {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, TelemetryError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path).await?;
        debug!(path = %path.display(), "event log opened");
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl EventHandler for JsonLinesSink {
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "json_lines_sink"
    }
}

/// Read back an event log written by [`JsonLinesSink`]. Blank lines are skipped.
pub async fn read_event_log(path: &Path) -> Result<Vec<Event>, TelemetryError> {
    let raw = tokio::fs::read_to_string(path).await?;
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(TelemetryError::from))
        .collect()
}

/// Mirrors bus events into `tracing`: errors at warn, lifecycle at info,
/// model and tool chatter at debug.
#[derive(Default)]
pub struct TracingEventLogger;

#[async_trait]
impl EventHandler for TracingEventLogger {
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        let kind = event.event_type();
        let agent_id = event.agent_id.as_ref().map(|a| a.as_str()).unwrap_or("-");
        let node_id = event.node_id.as_ref().map(|n| n.as_str()).unwrap_or("-");
        let operation = event.operation.as_deref().unwrap_or("-");
        let phase = event.phase.as_str();

        match event.status {
            EventStatus::Error | EventStatus::Retrying => {
                warn!(event = kind, agent_id, node_id, operation, phase, "engine event")
            }
            _ if kind.starts_with("node_") || kind.starts_with("agent_") => {
                info!(event = kind, agent_id, node_id, operation, phase, "engine event")
            }
            _ => debug!(event = kind, agent_id, node_id, operation, phase, "engine event"),
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "tracing_event_logger"
    }
}
