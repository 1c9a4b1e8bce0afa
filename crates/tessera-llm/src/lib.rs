pub mod retry;

pub mod mock;

pub use mock::{MockClient, MockResponse};
pub use retry::{retry_with, RetryAttempt, RetryError, RetryPolicy};
