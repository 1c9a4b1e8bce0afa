mod event_log;
mod logging;

pub use event_log::{read_event_log, JsonLinesSink, TracingEventLogger};
pub use logging::{CaptureLayer, CapturedLog, LogBuffer};

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Layer, Registry};

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid event record: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("failed to reload log filter: {0}")]
    Reload(String),

    #[error("telemetry was not installed by this guard")]
    NotInstalled,
}

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    #[serde(with = "level_name")]
    pub log_level: Level,
    /// Per-module level overrides (e.g. "tessera_llm" => DEBUG).
    #[serde(with = "module_level_names")]
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines on stdout; compact text otherwise.
    pub json: bool,
    /// Keep the most recent warn+ records in memory. 0 disables capture.
    pub capture_capacity: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: true,
            capture_capacity: 500,
        }
    }
}

impl TelemetryConfig {
    fn filter_directives(&self, module_levels: &[(String, Level)]) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

/// Handle returned by [`init_telemetry`].
pub struct TelemetryGuard {
    config: TelemetryConfig,
    installed: bool,
    reload: Option<reload::Handle<EnvFilter, Registry>>,
    module_levels: Arc<RwLock<Vec<(String, Level)>>>,
    captured: Option<Arc<LogBuffer>>,
}

impl TelemetryGuard {
    /// False when a global subscriber already existed (common in tests).
    pub fn is_installed(&self) -> bool {
        self.installed
    }

    /// Change the log level for a specific module at runtime.
    /// The rebuilt filter replaces any RUST_LOG directives.
    pub fn set_module_level(&self, module: &str, level: Level) -> Result<(), TelemetryError> {
        let directives = {
            let mut levels = self.module_levels.write();
            if let Some(entry) = levels.iter_mut().find(|(m, _)| m == module) {
                entry.1 = level;
            } else {
                levels.push((module.to_string(), level));
            }
            self.config.filter_directives(&levels)
        };

        let Some(handle) = &self.reload else {
            return Err(TelemetryError::NotInstalled);
        };
        handle
            .reload(EnvFilter::new(directives))
            .map_err(|e| TelemetryError::Reload(e.to_string()))
    }

    pub fn module_levels(&self) -> Vec<(String, Level)> {
        self.module_levels.read().clone()
    }

    /// Captured warn+ records, if capture is enabled.
    pub fn logs(&self) -> Option<&LogBuffer> {
        self.captured.as_deref()
    }
}

/// Install the global tracing subscriber. Safe to call more than once: later
/// calls leave the first subscriber in place and return an uninstalled guard.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let module_levels = Arc::new(RwLock::new(config.module_levels.clone()));

    let filter_str = config.filter_directives(&config.module_levels);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));
    let (filter_layer, reload_handle) = reload::Layer::new(env_filter);

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_target(true)
            .boxed()
    };

    let captured = (config.capture_capacity > 0)
        .then(|| Arc::new(LogBuffer::new(config.capture_capacity)));
    let capture_layer = captured.clone().map(CaptureLayer::new);

    let installed = tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(capture_layer)
        .try_init()
        .is_ok();

    if installed {
        tracing::debug!(filter = %filter_str, json = config.json, "telemetry initialised");
    }

    TelemetryGuard {
        installed,
        reload: installed.then_some(reload_handle),
        captured: if installed { captured } else { None },
        module_levels,
        config,
    }
}

mod level_name {
    use serde::{Deserialize, Deserializer, Serializer};
    use tracing::Level;

    pub fn serialize<S: Serializer>(level: &Level, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&level.to_string().to_lowercase())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Level, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

mod module_level_names {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serializer};
    use tracing::Level;

    pub fn serialize<S: Serializer>(levels: &[(String, Level)], s: S) -> Result<S::Ok, S::Error> {
        s.collect_map(levels.iter().map(|(m, l)| (m, l.to_string().to_lowercase())))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<(String, Level)>, D::Error> {
        let raw = BTreeMap::<String, String>::deserialize(d)?;
        raw.into_iter()
            .map(|(module, level)| {
                level
                    .parse()
                    .map(|l| (module, l))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}
