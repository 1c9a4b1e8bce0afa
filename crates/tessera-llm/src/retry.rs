use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use tessera_core::errors::ClientError;

/// Exponential backoff settings for transient client failures.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Total attempts = `max_retries + 1`.
    pub max_retries: u32,
    #[serde(with = "tessera_core::executor::duration_ms")]
    pub base_delay: Duration,
    #[serde(with = "tessera_core::executor::duration_ms")]
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Backoff before retry number `attempt` (0-based): `base * 2^attempt`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp_delay = self.base_delay.as_millis() as f64 * 2.0_f64.powi(attempt.min(62) as i32);
        let capped = exp_delay.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// `delay_for` with `±jitter_factor` applied.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.delay_for(attempt).as_millis() as f64;
        let range = base * self.jitter_factor.clamp(0.0, 1.0);
        if range < 1.0 {
            return Duration::from_millis(base as u64);
        }
        let jitter = rand::thread_rng().gen_range(-range..=range);
        Duration::from_millis((base + jitter).max(0.0) as u64)
    }
}

/// Details of a failed attempt that is about to be retried.
#[derive(Clone, Debug)]
pub struct RetryAttempt {
    /// 1-based number of the attempt that failed.
    pub attempt: u32,
    pub max_attempts: u32,
    pub delay: Duration,
    pub error: ClientError,
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error("gave up after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: ClientError },
    #[error(transparent)]
    Fatal(ClientError),
    #[error("cancelled")]
    Cancelled,
}

/// Run `op` until it succeeds, fails with a non-retryable error, exhausts the
/// policy, or `cancel` fires. `on_retry` is awaited before each backoff sleep.
pub async fn retry_with<T, F, Fut, N, NFut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
    mut on_retry: N,
) -> Result<T, RetryError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ClientError>>,
    N: FnMut(RetryAttempt) -> NFut,
    NFut: Future<Output = ()>,
{
    let max_attempts = policy.max_attempts();
    let mut attempt = 0;
    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            result = op(attempt) => result,
        };

        let error = match result {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(RetryError::Fatal(e)),
            Err(e) => e,
        };

        attempt += 1;
        if attempt >= max_attempts {
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last_error: error,
            });
        }

        let delay = policy.jittered_delay(attempt - 1);
        warn!(
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "retrying after transient client error"
        );
        on_retry(RetryAttempt {
            attempt,
            max_attempts,
            delay,
            error,
        })
        .await;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
