use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use tessera_core::client::ChatClient;
use tessera_core::context::{AgentContext, AgentState};
use tessera_core::definition::SubagentDefinition;
use tessera_core::events::{EventBody, Phase};
use tessera_core::executor::{SnapshotManager, ToolExecutor};
use tessera_core::node::CodeNode;
use tessera_core::result::{NodeResult, OperationError, TaskOutcome};
use tessera_core::workspace::WorkspaceService;

use crate::bundle::DefinitionSource;
use crate::bus::{panic_message, EventBus, ScopedEmitter};
use crate::config::{EngineConfig, RunnerConfig};
use crate::error::TaskError;
use crate::graph::AgentNode;
use crate::runner::{AgentRunner, RunnerServices, RunnerTask};
use crate::workspace::WorkspaceCache;

/// External collaborators the coordinator drives.
#[derive(Clone)]
pub struct EngineServices {
    pub client: Arc<dyn ChatClient>,
    pub executor: Arc<dyn ToolExecutor>,
    pub workspaces: Arc<dyn WorkspaceService>,
    pub definitions: Arc<dyn DefinitionSource>,
    pub snapshots: Option<Arc<dyn SnapshotManager>>,
}

/// Runs every requested operation of a node as a concurrent agent task.
pub struct Coordinator {
    config: EngineConfig,
    services: EngineServices,
    bus: EventBus,
    workspaces: Arc<WorkspaceCache>,
    admission: Arc<Semaphore>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl Coordinator {
    pub fn new(config: EngineConfig, services: EngineServices, bus: EventBus) -> Self {
        let permits = config.coordinator.max_concurrent_agents.max(1);
        Self {
            workspaces: Arc::new(WorkspaceCache::new(services.workspaces.clone())),
            admission: Arc::new(Semaphore::new(permits)),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
            config,
            services,
            bus,
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    #[instrument(skip(self, node, operations), fields(node_id = %node.id, operations = operations.len()))]
    pub async fn process_node(&self, node: &AgentNode, operations: &[String]) -> NodeResult {
        let start = Instant::now();
        let emitter = ScopedEmitter::new(self.bus.clone(), node.id.clone());
        emitter
            .emit(EventBody::NodeStarted {
                operations: operations.to_vec(),
            })
            .await;

        let mut result = NodeResult::new(node.id.clone());
        let mut tasks = JoinSet::new();
        let mut spawned = HashMap::new();

        for operation in operations {
            let definition = match self.services.definitions.load(operation).await {
                Ok(definition) => definition,
                Err(e) => {
                    warn!(operation = %operation, error = %e, "failed to load definition");
                    result.errors.push(OperationError {
                        operation: operation.clone(),
                        phase: Phase::Init,
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            let ctx = AgentContext::new(
                node.id.clone(),
                operation.clone(),
                describe_task(operation, &node.node),
            );
            let job = TaskJob {
                emitter: emitter.for_task(ctx.agent_id.clone(), operation.clone()),
                ctx,
                definition,
                node: Arc::clone(&node.node),
                services: self.services.clone(),
                bus: self.bus.clone(),
                config: self.config.runner.clone(),
                workspaces: Arc::clone(&self.workspaces),
                admission: Arc::clone(&self.admission),
                shutdown: self.shutdown.clone(),
            };
            let handle = tasks.spawn(job.run());
            spawned.insert(handle.id(), operation.clone());
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((_, (operation, Ok(TaskOutcome::Completed(agent_result))))) => {
                    result.operations.insert(operation, agent_result);
                }
                Ok((_, (operation, Ok(TaskOutcome::Cancelled)))) => {
                    debug!(operation = %operation, "task cancelled");
                }
                Ok((_, (operation, Err(e)))) => {
                    result.errors.push(OperationError {
                        operation,
                        phase: Phase::Run,
                        error: e.to_string(),
                    });
                }
                Err(e) => {
                    let operation = spawned.remove(&e.id()).unwrap_or_default();
                    error!(operation = %operation, error = %e, "agent task failed to join");
                    result.errors.push(OperationError {
                        operation,
                        phase: Phase::Run,
                        error: format!("task failed to join: {e}"),
                    });
                }
            }
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        info!(
            succeeded = result.operations.len(),
            failed = result.errors.len(),
            duration_ms,
            "node processed"
        );
        emitter
            .emit(EventBody::NodeCompleted {
                succeeded: result.operations.len(),
                failed: result.errors.len(),
                duration_ms,
            })
            .await;
        result
    }

    /// Cancel in-flight and queued tasks. They unwind through their cleanup.
    pub fn shutdown(&self) {
        info!("coordinator shutdown requested");
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Release every resource. Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let workspaces = self.workspaces.close_all().await;
        self.services.client.close().await;
        self.services.executor.shutdown().await;
        if let Some(snapshots) = &self.services.snapshots {
            snapshots.clear().await;
        }
        info!(workspaces, "coordinator closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Run `f` against this coordinator, then `close()` whether it returned or panicked.
    pub async fn run_scoped<'a, F, Fut, T>(&'a self, f: F) -> T
    where
        F: FnOnce(&'a Self) -> Fut,
        Fut: Future<Output = T> + 'a,
    {
        let outcome = AssertUnwindSafe(f(self)).catch_unwind().await;
        self.close().await;
        match outcome {
            Ok(value) => value,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

fn describe_task(operation: &str, node: &CodeNode) -> String {
    format!(
        "Run '{operation}' on {} `{}` in {}",
        node.kind,
        node.name,
        node.file_path.display()
    )
}

/// Everything one spawned task owns.
struct TaskJob {
    ctx: AgentContext,
    definition: Arc<SubagentDefinition>,
    node: Arc<CodeNode>,
    services: EngineServices,
    bus: EventBus,
    emitter: ScopedEmitter,
    config: RunnerConfig,
    workspaces: Arc<WorkspaceCache>,
    admission: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl TaskJob {
    async fn run(mut self) -> (String, Result<TaskOutcome, TaskError>) {
        let start = Instant::now();
        let executed = AssertUnwindSafe(self.execute(start)).catch_unwind().await;
        let outcome = match executed {
            Ok(outcome) => outcome,
            Err(panic) => {
                let msg = panic_message(&panic);
                error!(agent_id = %self.ctx.agent_id, panic = %msg, "agent task panicked");
                Err(TaskError::Panicked(msg))
            }
        };

        if let Err(e) = &outcome {
            if !self.ctx.state().is_terminal() {
                if let Err(te) = self.ctx.transition(AgentState::Errored) {
                    warn!(error = %te, "could not mark task errored");
                }
            }
            self.emitter
                .emit(EventBody::AgentErrored {
                    error: e.to_string(),
                    duration_ms: start.elapsed().as_millis() as u64,
                })
                .await;
        }

        let outcome = match AssertUnwindSafe(self.cleanup()).catch_unwind().await {
            Ok(()) => outcome,
            Err(panic) => {
                let msg = panic_message(&panic);
                error!(agent_id = %self.ctx.agent_id, panic = %msg, "task cleanup panicked");
                Err(TaskError::CleanupPanicked(msg))
            }
        };
        (self.ctx.operation.clone(), outcome)
    }

    async fn execute(&mut self, start: Instant) -> Result<TaskOutcome, TaskError> {
        let _permit = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Ok(self.cancelled().await),
            permit = Arc::clone(&self.admission).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return Ok(self.cancelled().await),
            },
        };

        let workspace = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Ok(self.cancelled().await),
            ws = self.workspaces.get_or_open(&self.ctx.agent_id) => ws?,
        };

        self.ctx.transition(AgentState::Executing)?;
        self.emitter
            .emit(EventBody::AgentStarted {
                task: self.ctx.task.clone(),
            })
            .await;

        let task = RunnerTask {
            agent_id: self.ctx.agent_id.clone(),
            operation: self.ctx.operation.clone(),
            task: self.ctx.task.clone(),
            node: Arc::clone(&self.node),
            definition: Arc::clone(&self.definition),
            workspace: Some(workspace),
        };
        let services = RunnerServices {
            client: Arc::clone(&self.services.client),
            executor: Arc::clone(&self.services.executor),
            snapshots: self.services.snapshots.clone(),
        };
        let mut runner = AgentRunner::new(task, services, self.bus.clone(), self.config.clone())?;

        match runner.run(&self.shutdown).await? {
            TaskOutcome::Completed(result) => {
                self.ctx.transition(AgentState::Completed)?;
                self.emitter
                    .emit(EventBody::AgentCompleted {
                        summary: result.summary.clone(),
                        changed_files: result.changed_files.clone(),
                        turns: runner.turn_count(),
                        duration_ms: start.elapsed().as_millis() as u64,
                    })
                    .await;
                Ok(TaskOutcome::Completed(result))
            }
            TaskOutcome::Cancelled => Ok(self.cancelled().await),
        }
    }

    async fn cancelled(&self) -> TaskOutcome {
        info!(agent_id = %self.ctx.agent_id, "agent task cancelled");
        self.emitter.emit(EventBody::AgentCancelled).await;
        TaskOutcome::Cancelled
    }

    async fn cleanup(&self) {
        if let Err(e) = self.workspaces.release(&self.ctx.agent_id).await {
            warn!(agent_id = %self.ctx.agent_id, error = %e, "failed to release workspace");
        }
        if let Some(snapshots) = &self.services.snapshots {
            snapshots.cleanup_agent(&self.ctx.agent_id).await;
        }
    }
}
