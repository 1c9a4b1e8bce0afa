pub mod dispatch;
pub mod fallback;
pub mod working_context;

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use tessera_core::client::ChatClient;
use tessera_core::definition::SubagentDefinition;
use tessera_core::events::EventBody;
use tessera_core::executor::{SnapshotManager, ToolExecutor};
use tessera_core::ids::AgentId;
use tessera_core::messages::{ChatMessage, ChatRequest, ChatResponse, ToolChoice, ToolSchema};
use tessera_core::node::CodeNode;
use tessera_core::result::{AgentResult, AgentStatus, TaskOutcome};
use tessera_core::workspace::Workspace;
use tessera_llm::{retry_with, RetryError};

use crate::bus::{EventBus, ScopedEmitter};
use crate::config::RunnerConfig;
use crate::error::RunnerError;
use crate::truncate::{preview, PREVIEW_CHARS};

pub use crate::config::ToolChoicePolicy;
pub use dispatch::{ToolDispatcher, ToolOutput, RESUME_SCRIPT_TOOL};
pub use working_context::WorkingContext;

const DEFAULT_NODE_CONTEXT: &str =
    "File: {{ file_path }}\n{{ node_type }} `{{ node_name }}`:\n\n```\n{{ node_text }}\n```";

/// One node × operation unit of work.
#[derive(Clone, Debug)]
pub struct RunnerTask {
    pub agent_id: AgentId,
    pub operation: String,
    pub task: String,
    pub node: Arc<CodeNode>,
    pub definition: Arc<SubagentDefinition>,
    pub workspace: Option<Workspace>,
}

#[derive(Clone)]
pub struct RunnerServices {
    pub client: Arc<dyn ChatClient>,
    pub executor: Arc<dyn ToolExecutor>,
    pub snapshots: Option<Arc<dyn SnapshotManager>>,
}

/// Drives one agent through model turns until it submits a result.
pub struct AgentRunner {
    agent_id: AgentId,
    operation: String,
    definition: Arc<SubagentDefinition>,
    config: RunnerConfig,
    client: Arc<dyn ChatClient>,
    dispatcher: ToolDispatcher,
    emitter: ScopedEmitter,
    tools: Vec<ToolSchema>,
    messages: Vec<ChatMessage>,
    working: WorkingContext,
    turn_count: u32,
    max_turns: u32,
}

impl AgentRunner {
    pub fn new(
        task: RunnerTask,
        services: RunnerServices,
        bus: EventBus,
        config: RunnerConfig,
    ) -> Result<Self, RunnerError> {
        if !services.client.resolves(&config.model) {
            return Err(RunnerError::ModelUnavailable(config.model.clone()));
        }

        let emitter = ScopedEmitter::new(bus, task.node.id.clone())
            .for_task(task.agent_id.clone(), task.operation.clone());
        let dispatcher = ToolDispatcher::new(
            task.definition.clone(),
            task.node.clone(),
            task.agent_id.clone(),
            task.workspace.clone(),
            services.executor,
            services.snapshots,
            emitter.clone(),
            config.execution_limits.clone(),
            config.max_tool_output,
        );
        let tools = dispatcher.schemas();
        let max_turns = config.effective_max_turns(task.definition.max_turns);

        let messages = vec![
            ChatMessage::system(task.definition.system_prompt.clone()),
            ChatMessage::user(seed_message(&task)),
        ];

        Ok(Self {
            agent_id: task.agent_id,
            operation: task.operation,
            definition: task.definition,
            working: WorkingContext::new(config.working_context_size),
            config,
            client: services.client,
            dispatcher,
            emitter,
            tools,
            messages,
            turn_count: 0,
            max_turns,
        })
    }

    pub fn turn_count(&self) -> u32 {
        self.turn_count
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn working_context(&self) -> &WorkingContext {
        &self.working
    }

    #[instrument(skip(self, cancel), fields(agent_id = %self.agent_id, operation = %self.operation))]
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<TaskOutcome, RunnerError> {
        while self.turn_count < self.max_turns {
            if cancel.is_cancelled() {
                return Ok(TaskOutcome::Cancelled);
            }
            let turn = self.turn_count + 1;
            self.refresh_system_message();

            let tool_choice = self.config.tool_choice.choice_for(turn, self.max_turns);
            let request = ChatRequest {
                model: self.config.model.clone(),
                messages: self.messages.clone(),
                tools: self.tools.clone(),
                tool_choice,
                max_tokens: self.config.max_tokens,
                temperature: self.config.temperature,
            };
            self.emitter
                .emit(EventBody::ModelRequest {
                    turn,
                    model: request.model.clone(),
                    message_count: request.messages.len(),
                    tool_count: request.tools.len(),
                    tool_choice,
                    payload: self.payload(&request),
                })
                .await;

            let start = Instant::now();
            let response = match self.complete(&request, cancel).await {
                Ok(response) => response,
                Err(RetryError::Cancelled) => return Ok(TaskOutcome::Cancelled),
                Err(RetryError::Exhausted { attempts, last_error }) => {
                    return Err(RunnerError::ModelUnreachable { attempts, last_error })
                }
                Err(RetryError::Fatal(e)) => return Err(e.into()),
            };
            self.emitter
                .emit(EventBody::ModelResponse {
                    turn,
                    duration_ms: start.elapsed().as_millis() as u64,
                    prompt_tokens: response.usage.prompt_tokens,
                    completion_tokens: response.usage.completion_tokens,
                    total_tokens: response.usage.total_tokens,
                    tool_call_count: response.tool_calls.len(),
                    response_preview: preview(response.text_content(), PREVIEW_CHARS),
                })
                .await;
            self.turn_count = turn;

            let mut calls = response.tool_calls.clone();
            if calls.is_empty() {
                if let Some(call) = response.content.as_deref().and_then(fallback::parse_tool_call) {
                    debug!(tool = %call.name, "recovered tool call from text");
                    calls.push(call);
                }
            }
            self.messages
                .push(ChatMessage::assistant(response.content.clone(), calls.clone()));

            if calls.is_empty() {
                if tool_choice == ToolChoice::Required {
                    return Err(RunnerError::NoTerminationCall { turn });
                }
                info!(turn, "model finished without submitting, using text as summary");
                return Ok(TaskOutcome::Completed(AgentResult::success(
                    self.agent_id.clone(),
                    response.text_content(),
                )));
            }

            for call in &calls {
                if call.name == self.definition.termination_tool {
                    let result = parse_submission(&self.agent_id, &call.arguments)?;
                    info!(turn, status = ?result.status, "agent submitted result");
                    return Ok(TaskOutcome::Completed(result));
                }

                let output = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(TaskOutcome::Cancelled),
                    output = self.dispatcher.dispatch(call) => output,
                };
                self.working.record(&call.name, &output.content, output.is_error);
                self.messages
                    .push(ChatMessage::tool(call.id.clone(), call.name.clone(), output.content));
            }
            self.trim_history();
        }

        warn!(max_turns = self.max_turns, "turn limit reached without a submission");
        Err(RunnerError::TurnLimitExceeded(self.max_turns))
    }

    async fn complete(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse, RetryError> {
        let client = &self.client;
        let emitter = &self.emitter;
        retry_with(
            &self.config.retry,
            cancel,
            |_| client.complete(request),
            |attempt| {
                emitter.emit(EventBody::ModelRetry {
                    attempt: attempt.attempt,
                    max_attempts: attempt.max_attempts,
                    delay_ms: attempt.delay.as_millis() as u64,
                    error: attempt.error.to_string(),
                })
            },
        )
        .await
    }

    fn payload(&self, request: &ChatRequest) -> Option<String> {
        if !self.config.emit_payloads {
            return None;
        }
        match serde_json::to_string(request) {
            Ok(json) => Some(preview(&json, self.config.payload_max_chars)),
            Err(e) => {
                warn!(error = %e, "failed to serialize request payload");
                None
            }
        }
    }

    fn refresh_system_message(&mut self) {
        let mut prompt = self.definition.system_prompt.clone();
        if self.config.dynamic_context {
            if let Some(section) = self.working.render() {
                if !prompt.is_empty() {
                    prompt.push_str("\n\n");
                }
                prompt.push_str(&section);
            }
        }
        match self.messages.first_mut() {
            Some(first) if first.is_system() => *first = ChatMessage::system(prompt),
            _ => self.messages.insert(0, ChatMessage::system(prompt)),
        }
    }

    /// Keep the system message plus the most recent messages. An assistant
    /// message and its tool results go together, and the latest assistant
    /// message is always kept even when its results alone exceed the limit.
    fn trim_history(&mut self) {
        let max = self.config.max_history_messages;
        if max == 0 || self.messages.len() <= max {
            return;
        }
        let len = self.messages.len();
        let latest = self
            .messages
            .iter()
            .rposition(|m| matches!(m, ChatMessage::Assistant { .. }))
            .unwrap_or(len);
        let mut cut = (len - max.saturating_sub(1)).max(1);
        while cut < len && self.messages[cut].is_tool() {
            cut += 1;
        }
        let cut = cut.min(latest);
        if cut <= 1 {
            return;
        }
        let dropped = cut - 1;
        self.messages.drain(1..cut);
        debug!(dropped, kept = self.messages.len(), "trimmed history");
    }
}

fn seed_message(task: &RunnerTask) -> String {
    let context = if task.definition.node_context.trim().is_empty() {
        let mut def = (*task.definition).clone();
        def.node_context = DEFAULT_NODE_CONTEXT.to_string();
        def.render_node_context(&task.node)
    } else {
        task.definition.render_node_context(&task.node)
    };
    format!("Task: {}\n\n{}", task.task, context)
}

/// Parse termination-tool arguments into a result.
pub fn parse_submission(task_id: &AgentId, arguments: &str) -> Result<AgentResult, RunnerError> {
    let invalid = |msg: &str| RunnerError::InvalidSubmission(msg.to_string());

    let value: Value = serde_json::from_str(arguments)
        .map_err(|e| RunnerError::InvalidSubmission(format!("arguments are not valid JSON: {e}")))?;
    let obj = value.as_object().ok_or_else(|| invalid("arguments must be an object"))?;

    let summary = obj
        .get("summary")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("'summary' must be a string"))?;

    let changed_files = match obj.get("changed_files") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| invalid("'changed_files' must contain only strings"))?,
        Some(_) => return Err(invalid("'changed_files' must be an array")),
    };

    let details = match obj.get("details") {
        None | Some(Value::Null) => serde_json::Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(_) => return Err(invalid("'details' must be an object")),
    };

    let status = match obj.get("status") {
        None | Some(Value::Null) => AgentStatus::Success,
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|_| invalid("'status' must be one of success, failed, skipped"))?,
    };

    Ok(AgentResult {
        status,
        task_id: task_id.clone(),
        changed_files,
        summary: summary.to_string(),
        details,
        error: obj.get("error").and_then(Value::as_str).map(str::to_string),
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_support::{lint_definition, sample_node, FakeExecutor, RecordingHandler};
    use tessera_core::errors::ClientError;
    use tessera_core::events::EventKind;
    use tessera_core::executor::ExecutionOutcome;
    use tessera_core::messages::ToolCall;
    use tessera_llm::{MockClient, MockResponse, RetryPolicy};

    fn submit(summary: &str) -> MockResponse {
        MockResponse::tool_call(
            "submit_result",
            serde_json::json!({"summary": summary, "changed_files": ["src/app.py"]}),
        )
    }

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter_factor: 0.0,
        }
    }

    struct Harness {
        runner: AgentRunner,
        client: Arc<MockClient>,
        recorder: Arc<RecordingHandler>,
    }

    fn harness(client: MockClient, config: RunnerConfig) -> Harness {
        harness_with(client, config, lint_definition(), FakeExecutor::default())
    }

    fn harness_with(
        client: MockClient,
        config: RunnerConfig,
        definition: SubagentDefinition,
        executor: FakeExecutor,
    ) -> Harness {
        let bus = EventBus::new();
        let recorder = Arc::new(RecordingHandler::default());
        bus.subscribe_all(recorder.clone());
        let client = Arc::new(client);
        let task = RunnerTask {
            agent_id: AgentId::from_raw("agent_test"),
            operation: "lint".into(),
            task: "Lint this function".into(),
            node: Arc::new(sample_node("n1")),
            definition: Arc::new(definition),
            workspace: None,
        };
        let services = RunnerServices {
            client: client.clone(),
            executor: Arc::new(executor),
            snapshots: None,
        };
        let runner = AgentRunner::new(task, services, bus, config).unwrap();
        Harness {
            runner,
            client,
            recorder,
        }
    }

    fn completed(outcome: TaskOutcome) -> AgentResult {
        match outcome {
            TaskOutcome::Completed(result) => result,
            TaskOutcome::Cancelled => panic!("unexpected cancellation"),
        }
    }

    #[tokio::test]
    async fn submission_on_first_turn() {
        let mut h = harness(MockClient::new(vec![submit("all clean")]), RunnerConfig::default());
        let result = completed(h.runner.run(&CancellationToken::new()).await.unwrap());

        assert_eq!(result.status, AgentStatus::Success);
        assert_eq!(result.summary, "all clean");
        assert_eq!(result.changed_files, vec!["src/app.py"]);
        assert_eq!(result.task_id.as_str(), "agent_test");
        assert_eq!(h.runner.turn_count(), 1);
        assert_eq!(
            h.recorder.kinds(),
            vec![EventKind::ModelRequest, EventKind::ModelResponse]
        );
    }

    #[tokio::test]
    async fn seed_message_carries_task_and_node() {
        let mut h = harness(MockClient::new(vec![submit("ok")]), RunnerConfig::default());
        h.runner.run(&CancellationToken::new()).await.unwrap();

        let request = &h.client.requests()[0];
        let ChatMessage::User { content } = &request.messages[1] else {
            panic!("expected seed user message");
        };
        assert!(content.starts_with("Task: Lint this function"));
        assert!(content.contains("def handler"));
        assert!(request.tools.iter().any(|t| t.name == "submit_result"));
    }

    #[tokio::test]
    async fn turn_limit_without_submission() {
        let client = MockClient::always(MockResponse::tool_call("run_lint", serde_json::json!({})));
        let config = RunnerConfig {
            max_turns: Some(2),
            ..RunnerConfig::default()
        };
        let mut h = harness(client, config);
        let err = h.runner.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, RunnerError::TurnLimitExceeded(2)));
        assert_eq!(h.runner.turn_count(), 2);
        assert_eq!(h.client.call_count(), 2);
    }

    #[tokio::test]
    async fn connection_errors_exhaust_retries() {
        let client = MockClient::always(MockResponse::Error(ClientError::Connection("refused".into())));
        let config = RunnerConfig {
            retry: fast_retry(2),
            ..RunnerConfig::default()
        };
        let mut h = harness(client, config);
        let err = h.runner.run(&CancellationToken::new()).await.unwrap_err();

        match err {
            RunnerError::ModelUnreachable { attempts, last_error } => {
                assert_eq!(attempts, 3);
                assert!(matches!(last_error, ClientError::Connection(_)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let retries = h
            .recorder
            .events()
            .iter()
            .filter(|e| e.kind() == EventKind::ModelRetry)
            .count();
        assert_eq!(retries, 2);
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let client = MockClient::new(vec![
            MockResponse::Error(ClientError::Connection("reset".into())),
            MockResponse::Error(ClientError::Timeout(Duration::from_secs(30))),
            submit("done"),
        ]);
        let config = RunnerConfig {
            retry: fast_retry(3),
            ..RunnerConfig::default()
        };
        let mut h = harness(client, config);
        let result = completed(h.runner.run(&CancellationToken::new()).await.unwrap());
        assert_eq!(result.summary, "done");
        assert_eq!(h.client.call_count(), 3);
        assert_eq!(h.runner.turn_count(), 1);
    }

    #[tokio::test]
    async fn non_retryable_error_surfaces() {
        let client = MockClient::new(vec![MockResponse::Error(ClientError::Status {
            status: 400,
            body: "bad request".into(),
        })]);
        let mut h = harness(client, RunnerConfig::default());
        let err = h.runner.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, RunnerError::Client(ClientError::Status { status: 400, .. })));
        assert_eq!(h.client.call_count(), 1);
    }

    #[tokio::test]
    async fn unresolvable_model_fails_fast() {
        let client = Arc::new(MockClient::new(vec![]).with_models(&["other"]));
        let task = RunnerTask {
            agent_id: AgentId::new(),
            operation: "lint".into(),
            task: "t".into(),
            node: Arc::new(sample_node("n1")),
            definition: Arc::new(lint_definition()),
            workspace: None,
        };
        let services = RunnerServices {
            client: client.clone(),
            executor: Arc::new(FakeExecutor::default()),
            snapshots: None,
        };
        let err = AgentRunner::new(task, services, EventBus::new(), RunnerConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, RunnerError::ModelUnavailable(ref m) if m == "default"));
        assert_eq!(client.call_count(), 0);
    }

    #[tokio::test]
    async fn cancelled_before_first_turn() {
        let mut h = harness(MockClient::new(vec![submit("x")]), RunnerConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(h.runner.run(&cancel).await.unwrap(), TaskOutcome::Cancelled);
        assert_eq!(h.client.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_during_model_call() {
        let client = MockClient::new(vec![MockResponse::delayed(
            Duration::from_secs(60),
            submit("late"),
        )]);
        let mut h = harness(client, RunnerConfig::default());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        assert_eq!(h.runner.run(&cancel).await.unwrap(), TaskOutcome::Cancelled);
    }

    #[tokio::test]
    async fn text_tool_call_is_recovered() {
        let text = "```json\n{\"name\": \"submit_result\", \"arguments\": {\"summary\": \"from text\"}}\n```";
        let mut h = harness(MockClient::new(vec![MockResponse::text(text)]), RunnerConfig::default());
        let result = completed(h.runner.run(&CancellationToken::new()).await.unwrap());
        assert_eq!(result.summary, "from text");
    }

    #[tokio::test]
    async fn plain_text_when_required_is_error() {
        let config = RunnerConfig {
            tool_choice: ToolChoicePolicy::Required,
            ..RunnerConfig::default()
        };
        let mut h = harness(MockClient::new(vec![MockResponse::text("looks fine")]), config);
        let err = h.runner.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, RunnerError::NoTerminationCall { turn: 1 }));
    }

    #[tokio::test]
    async fn plain_text_when_auto_is_best_effort_success() {
        let mut h = harness(MockClient::new(vec![MockResponse::text("looks fine")]), RunnerConfig::default());
        let result = completed(h.runner.run(&CancellationToken::new()).await.unwrap());
        assert_eq!(result.summary, "looks fine");
        assert!(result.changed_files.is_empty());
    }

    #[tokio::test]
    async fn last_turn_requires_a_tool() {
        let config = RunnerConfig {
            max_turns: Some(2),
            ..RunnerConfig::default()
        };
        let client = MockClient::new(vec![
            MockResponse::tool_call("run_lint", serde_json::json!({})),
            submit("ok"),
        ]);
        let mut h = harness(client, config);
        h.runner.run(&CancellationToken::new()).await.unwrap();
        let choices: Vec<ToolChoice> = h.client.requests().iter().map(|r| r.tool_choice).collect();
        assert_eq!(choices, vec![ToolChoice::Auto, ToolChoice::Required]);
    }

    #[tokio::test]
    async fn malformed_submission_is_error() {
        let client = MockClient::new(vec![MockResponse::tool_call(
            "submit_result",
            serde_json::json!({"changed_files": "not-a-list", "summary": "x"}),
        )]);
        let mut h = harness(client, RunnerConfig::default());
        let err = h.runner.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, RunnerError::InvalidSubmission(_)));
    }

    #[tokio::test]
    async fn unknown_tool_is_fed_back_and_loop_continues() {
        let client = MockClient::new(vec![
            MockResponse::tool_call("does_not_exist", serde_json::json!({})),
            submit("recovered"),
        ]);
        let mut h = harness(client, RunnerConfig::default());
        let result = completed(h.runner.run(&CancellationToken::new()).await.unwrap());
        assert_eq!(result.summary, "recovered");

        let second = &h.client.requests()[1];
        let tool_msg = second.messages.iter().find(|m| m.is_tool()).unwrap();
        let ChatMessage::Tool { content, .. } = tool_msg else { unreachable!() };
        assert_eq!(content, "Unknown tool: does_not_exist");
    }

    #[tokio::test]
    async fn tool_output_reaches_working_context() {
        let executor = FakeExecutor::default().with_result(
            "/bundles/lint/run_lint.pym",
            ExecutionOutcome::Success(serde_json::json!({"knowledge": {"style": "pep8"}})),
        );
        let client = MockClient::new(vec![
            MockResponse::tool_call("run_lint", serde_json::json!({})),
            submit("ok"),
        ]);
        let mut h = harness_with(client, RunnerConfig::default(), lint_definition(), executor);
        h.runner.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(h.runner.working_context().knowledge()["style"], "pep8");
        let ChatMessage::System { content } = &h.client.requests()[1].messages[0] else {
            panic!("expected system message first");
        };
        assert!(content.contains("Known facts:"));
        assert!(content.contains("- style: pep8"));
    }

    fn roles(messages: &[ChatMessage]) -> Vec<&'static str> {
        messages
            .iter()
            .map(|m| match m {
                ChatMessage::System { .. } => "system",
                ChatMessage::User { .. } => "user",
                ChatMessage::Assistant { .. } => "assistant",
                ChatMessage::Tool { .. } => "tool",
            })
            .collect()
    }

    /// Tool messages following an assistant message answer exactly its calls.
    fn assert_results_follow_calls(messages: &[ChatMessage]) {
        let mut pending: Vec<String> = Vec::new();
        for message in messages {
            match message {
                ChatMessage::Assistant { tool_calls, .. } => {
                    assert!(pending.is_empty(), "unanswered calls: {pending:?}");
                    pending = tool_calls.iter().map(|c| c.id.as_str().to_string()).collect();
                }
                ChatMessage::Tool { tool_call_id, .. } => {
                    assert!(!pending.is_empty(), "tool result without its assistant message");
                    assert_eq!(pending.remove(0), tool_call_id.as_str());
                }
                _ => assert!(pending.is_empty(), "unanswered calls: {pending:?}"),
            }
        }
    }

    #[tokio::test]
    async fn history_is_trimmed_by_whole_turns() {
        let config = RunnerConfig {
            max_history_messages: 4,
            max_turns: Some(10),
            ..RunnerConfig::default()
        };
        let mut responses: Vec<MockResponse> = (0..4)
            .map(|_| MockResponse::tool_call("run_lint", serde_json::json!({})))
            .collect();
        responses.push(submit("ok"));
        let mut h = harness(MockClient::new(responses), config);
        h.runner.run(&CancellationToken::new()).await.unwrap();

        let requests = h.client.requests();
        assert_eq!(requests.len(), 5);
        assert_eq!(roles(&requests[0].messages), vec!["system", "user"]);
        assert_eq!(
            roles(&requests[1].messages),
            vec!["system", "user", "assistant", "tool"]
        );
        for request in &requests[2..] {
            assert_eq!(roles(&request.messages), vec!["system", "assistant", "tool"]);
            assert_results_follow_calls(&request.messages);
        }
    }

    #[tokio::test]
    async fn latest_turn_survives_trimming_when_it_exceeds_the_limit() {
        let config = RunnerConfig {
            max_history_messages: 3,
            ..RunnerConfig::default()
        };
        let calls = (0..3).map(|_| ToolCall::new("run_lint", "{}".to_string())).collect();
        let client = MockClient::new(vec![
            MockResponse::Response(ChatResponse::with_tool_calls(calls)),
            submit("ok"),
        ]);
        let mut h = harness(client, config);
        let result = completed(h.runner.run(&CancellationToken::new()).await.unwrap());
        assert_eq!(result.summary, "ok");

        let second = &h.client.requests()[1];
        assert_eq!(
            roles(&second.messages),
            vec!["system", "assistant", "tool", "tool", "tool"]
        );
        assert_results_follow_calls(&second.messages);
        assert!(second.messages[1].has_tool_calls());
    }

    #[tokio::test]
    async fn payloads_only_when_enabled() {
        let config = RunnerConfig {
            emit_payloads: true,
            payload_max_chars: 50,
            ..RunnerConfig::default()
        };
        let mut h = harness(MockClient::new(vec![submit("ok")]), config);
        h.runner.run(&CancellationToken::new()).await.unwrap();
        let request = &h.recorder.events()[0];
        match &request.body {
            EventBody::ModelRequest { payload: Some(p), .. } => assert!(p.chars().count() <= 53),
            other => panic!("unexpected body: {other:?}"),
        }

        let mut h = harness(MockClient::new(vec![submit("ok")]), RunnerConfig::default());
        h.runner.run(&CancellationToken::new()).await.unwrap();
        assert!(matches!(
            h.recorder.events()[0].body,
            EventBody::ModelRequest { payload: None, .. }
        ));
    }

    #[test]
    fn submission_parsing() {
        let id = AgentId::from_raw("agent_x");
        let result = parse_submission(
            &id,
            r#"{"summary": "s", "details": {"n": 1}, "status": "skipped", "error": "nothing to do"}"#,
        )
        .unwrap();
        assert_eq!(result.status, AgentStatus::Skipped);
        assert_eq!(result.details["n"], 1);
        assert_eq!(result.error.as_deref(), Some("nothing to do"));

        assert!(parse_submission(&id, r#"{"changed_files": []}"#).is_err());
        assert!(parse_submission(&id, r#"{"summary": "s", "details": []}"#).is_err());
        assert!(parse_submission(&id, r#"{"summary": "s", "changed_files": [1]}"#).is_err());
        assert!(parse_submission(&id, r#"{"summary": "s", "status": "maybe"}"#).is_err());
        assert!(parse_submission(&id, "not json").is_err());
    }
}
