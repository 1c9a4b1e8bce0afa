use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use tessera_core::definition::SubagentDefinition;
use tessera_core::errors::DefinitionError;

pub const BUNDLE_FILE: &str = "bundle.json";

/// Resolves an operation name to its agent definition.
#[async_trait]
pub trait DefinitionSource: Send + Sync {
    async fn load(&self, operation: &str) -> Result<Arc<SubagentDefinition>, DefinitionError>;
}

/// Fixed in-memory definitions.
#[derive(Default)]
pub struct StaticDefinitions {
    definitions: HashMap<String, Arc<SubagentDefinition>>,
}

impl StaticDefinitions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, operation: impl Into<String>, definition: SubagentDefinition) -> Self {
        self.definitions.insert(operation.into(), Arc::new(definition));
        self
    }
}

#[async_trait]
impl DefinitionSource for StaticDefinitions {
    async fn load(&self, operation: &str) -> Result<Arc<SubagentDefinition>, DefinitionError> {
        self.definitions
            .get(operation)
            .cloned()
            .ok_or_else(|| DefinitionError::UnknownOperation(operation.to_string()))
    }
}

/// Reads `<root>/<operation>/bundle.json`, once per operation.
pub struct BundleDirectory {
    root: PathBuf,
    cache: DashMap<String, Arc<SubagentDefinition>>,
}

impl BundleDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: DashMap::new(),
        }
    }
}

#[async_trait]
impl DefinitionSource for BundleDirectory {
    async fn load(&self, operation: &str) -> Result<Arc<SubagentDefinition>, DefinitionError> {
        if let Some(def) = self.cache.get(operation) {
            return Ok(Arc::clone(&def));
        }

        let bundle_dir = self.root.join(operation);
        let path = bundle_dir.join(BUNDLE_FILE);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DefinitionError::UnknownOperation(operation.to_string()));
            }
            Err(e) => {
                return Err(DefinitionError::Read {
                    path,
                    reason: e.to_string(),
                });
            }
        };

        let mut def: SubagentDefinition =
            serde_json::from_str(&raw).map_err(|e| DefinitionError::Invalid {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        if def.max_turns == 0 {
            return Err(DefinitionError::Invalid {
                path,
                reason: "max_turns must be at least 1".into(),
            });
        }
        def.resolve_paths(&bundle_dir);
        debug!(operation, tools = def.tools.len(), "loaded bundle");

        let cached = self
            .cache
            .entry(operation.to_string())
            .or_insert_with(|| Arc::new(def))
            .clone();
        Ok(cached)
    }
}
