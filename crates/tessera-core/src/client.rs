use async_trait::async_trait;

use crate::errors::ClientError;
use crate::messages::{ChatRequest, ChatResponse};

/// Chat-completion endpoint used by the runner.
///
/// Request timeouts are the client's business; the runner only owns turn and
/// retry budgets.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Whether `model` can be served. Checked at runner construction, before any request.
    fn resolves(&self, model: &str) -> bool;

    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, ClientError>;

    async fn close(&self) {}
}
