use std::future::Future;
use std::time::Duration;

use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    RetryIf,
};
use tracing::warn;

use crate::error::AppError;

/// Bounded retry policy for transient capability and storage errors.
/// Exponential backoff with full jitter; attempts are bounded, there is
/// no global time budget.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    fn strategy(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(self.initial_backoff.as_millis().max(1) as u64)
            .max_delay(self.max_backoff)
            .map(jitter)
            .take(self.max_attempts.saturating_sub(1))
    }
}

/// Runs `op`, retrying on errors for which [`AppError::is_transient`]
/// holds, up to the policy's attempt bound. The final error is returned
/// unchanged so callers keep the original failure kind.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let label = label.to_owned();
    RetryIf::spawn(
        policy.strategy(),
        move || op(),
        |err: &AppError| {
            let retryable = err.is_transient();
            if retryable {
                warn!(operation = %label, error = %err, "transient failure; retrying");
            }
            retryable
        },
    )
    .await
}
