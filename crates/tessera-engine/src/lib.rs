pub mod bundle;
pub mod bus;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod graph;
pub mod runner;
pub mod truncate;
pub mod workspace;

#[cfg(test)]
pub(crate) mod test_support;

pub use bundle::{BundleDirectory, DefinitionSource, StaticDefinitions};
pub use bus::{EventBus, EventStream, ScopedEmitter, SubscriptionId};
pub use config::{CoordinatorConfig, EngineConfig, RunnerConfig};
pub use coordinator::{Coordinator, EngineServices};
pub use error::{BusError, ConfigError, GraphError, RunnerError, TaskError};
pub use graph::{build_graph, AgentGraph, AgentNode};
pub use runner::{AgentRunner, RunnerServices, RunnerTask, ToolChoicePolicy};
pub use workspace::{DirectoryWorkspaces, WorkspaceCache};
