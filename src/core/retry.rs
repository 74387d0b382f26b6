//! Retry wrapper with exponential backoff.
//!
//! Runs one unit of work up to `max_attempts` times, sleeping
//! `base_delay_ms * 2^(attempt-1)` between attempts, and always produces a
//! concrete [`StepOutcome`]. Sleeps are tokio timers, so a backing-off step
//! never blocks other pipelines.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::domain::StepOutcome;

/// Attempt budget and backoff base for one step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try). Values below 1 act as 1.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt, in milliseconds
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay() -> u64 {
    1000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
        }
    }

    /// Effective attempt budget; at least one attempt always happens
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay after failed attempt `attempt` (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.attempts()
    }

    /// Run `operation` until it succeeds or the attempt budget is spent.
    ///
    /// `label` only feeds the tracing output.
    pub async fn execute<F, Fut>(&self, label: &str, mut operation: F) -> StepOutcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<Value>>,
    {
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            match operation().await {
                Ok(result) => {
                    debug!(step = label, attempt, "Step succeeded");
                    return StepOutcome::success(attempt, result);
                }
                Err(e) if self.should_retry(attempt) => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        step = label,
                        attempt,
                        max_attempts = self.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %format!("{:#}", e),
                        "Step failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    let message = format!("{:#}", e);
                    error!(step = label, attempt, error = %message, "Step failed permanently");
                    return StepOutcome::failure(attempt, message);
                }
            }
        }
    }
}
