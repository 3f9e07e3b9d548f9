//! Best-effort retries for shutdown cleanup.
//!
//! Control loops never retry on their own; a failed iteration becomes a state
//! transition. Only shutdown steps (drive release, automation stop, session close)
//! go through [`retry`], since there is no later tick to try again.

use crate::error::{AppResult, StationError};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// The maximum number of attempts, the first one included.
    pub max_attempts: u32,
    /// The delay between attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(100),
        }
    }
}

/// Run `operation` until it succeeds or the policy is exhausted.
///
/// Rejected input is returned immediately; repeating it cannot help.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut operation: F) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_rejected_input() || attempt >= attempts => {
                warn!(step = label, attempt, error = %e, "giving up");
                return Err(e);
            }
            Err(e) => {
                warn!(step = label, attempt, error = %e, "retrying");
                attempt += 1;
                sleep(policy.backoff_delay).await;
            }
        }
    }
}

/// Collect the failures of several cleanup steps into one error.
pub fn combine(errors: Vec<StationError>) -> AppResult<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(StationError::ShutdownFailed(errors))
    }
}
