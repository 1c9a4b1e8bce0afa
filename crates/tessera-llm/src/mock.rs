use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use tessera_core::client::ChatClient;
use tessera_core::errors::ClientError;
use tessera_core::messages::{ChatRequest, ChatResponse, ToolCall};

/// Pre-programmed responses for deterministic testing without a real endpoint.
#[derive(Clone, Debug)]
pub enum MockResponse {
    Response(ChatResponse),
    Error(ClientError),
    /// Wait a duration, then resolve the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    pub fn text(text: &str) -> Self {
        Self::Response(ChatResponse::text(text))
    }

    /// A single structured tool call.
    pub fn tool_call(name: &str, arguments: serde_json::Value) -> Self {
        Self::Response(ChatResponse::with_tool_calls(vec![ToolCall::new(
            name,
            arguments.to_string(),
        )]))
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Scripted chat client. Responses are served in order; once the script is
/// exhausted the fallback (if any) is served forever.
pub struct MockClient {
    script: Mutex<VecDeque<MockResponse>>,
    fallback: Option<MockResponse>,
    models: Option<Vec<String>>,
    requests: Mutex<Vec<ChatRequest>>,
    call_count: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    closed: AtomicBool,
}

impl MockClient {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            script: Mutex::new(responses.into()),
            fallback: None,
            models: None,
            requests: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// A client that answers every request with `response`.
    pub fn always(response: MockResponse) -> Self {
        Self::new(Vec::new()).with_fallback(response)
    }

    pub fn with_fallback(mut self, response: MockResponse) -> Self {
        self.fallback = Some(response);
        self
    }

    /// Restrict `resolves` to the given model names.
    pub fn with_models(mut self, models: &[&str]) -> Self {
        self.models = Some(models.iter().map(|m| m.to_string()).collect());
        self
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn next_response(&self) -> Option<MockResponse> {
        self.script.lock().pop_front().or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl ChatClient for MockClient {
    fn resolves(&self, model: &str) -> bool {
        match &self.models {
            Some(models) => models.iter().any(|m| m == model),
            None => true,
        }
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, ClientError> {
        let idx = self.call_count.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());

        let Some(response) = self.next_response() else {
            return Err(ClientError::InvalidResponse(format!(
                "MockClient: no response configured for call {idx}"
            )));
        };

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let result = resolve_response(response).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Unrolls nested delays iteratively to avoid recursive async.
async fn resolve_response(response: MockResponse) -> Result<ChatResponse, ClientError> {
    let mut current = response;
    loop {
        match current {
            MockResponse::Response(r) => return Ok(r),
            MockResponse::Error(e) => return Err(e),
            MockResponse::Delay(duration, inner) => {
                tokio::time::sleep(duration).await;
                current = *inner;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::messages::ToolChoice;

    fn request() -> ChatRequest {
        ChatRequest {
            model: "mock-model".into(),
            messages: vec![],
            tools: vec![],
            tool_choice: ToolChoice::Auto,
            max_tokens: None,
            temperature: None,
        }
    }

    #[tokio::test]
    async fn sequential_responses() {
        let mock = MockClient::new(vec![MockResponse::text("first"), MockResponse::text("second")]);
        assert_eq!(mock.complete(&request()).await.unwrap().text_content(), "first");
        assert_eq!(mock.complete(&request()).await.unwrap().text_content(), "second");
        assert_eq!(mock.call_count(), 2);
        assert_eq!(mock.requests().len(), 2);
    }

    #[tokio::test]
    async fn exhausted_without_fallback_errors() {
        let mock = MockClient::new(vec![MockResponse::text("only one")]);
        let _ = mock.complete(&request()).await;
        let err = mock.complete(&request()).await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn fallback_repeats_forever() {
        let mock = MockClient::always(MockResponse::Error(ClientError::Connection("down".into())));
        for _ in 0..5 {
            assert!(mock.complete(&request()).await.unwrap_err().is_retryable());
        }
    }

    #[tokio::test]
    async fn tool_call_response() {
        let mock = MockClient::new(vec![MockResponse::tool_call(
            "submit_result",
            serde_json::json!({"summary": "ok"}),
        )]);
        let resp = mock.complete(&request()).await.unwrap();
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].name, "submit_result");
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_response() {
        let mock = MockClient::new(vec![MockResponse::delayed(
            Duration::from_millis(50),
            MockResponse::text("after delay"),
        )]);
        let start = tokio::time::Instant::now();
        let resp = mock.complete(&request()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(resp.text_content(), "after delay");
    }

    #[test]
    fn model_resolution() {
        assert!(MockClient::new(vec![]).resolves("anything"));
        let mock = MockClient::new(vec![]).with_models(&["gpt-test"]);
        assert!(mock.resolves("gpt-test"));
        assert!(!mock.resolves("other"));
    }

    #[tokio::test]
    async fn close_is_recorded() {
        let mock = MockClient::new(vec![]);
        mock.close().await;
        assert!(mock.is_closed());
    }
}
