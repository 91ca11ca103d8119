//! Retrying fallible async operations with exponential backoff.

use std::future::Future;
use std::time::Duration;

use crate::error::Result;

/// How many times to try, and how long to wait between tries.
///
/// The wait after failed attempt `n` is `initial * 2^(n-1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, initial: Duration, max: Duration) -> Self {
        Self {
            attempts,
            initial,
            max,
        }
    }

    /// Delay after the 1-based `attempt` fails.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial.saturating_mul(factor).min(self.max)
    }
}

/// Runs `op` until it succeeds or `policy.attempts` is used up.
///
/// `op` always runs at least once and receives the 1-based attempt number.
/// The last error is returned.
pub async fn retry<T, F, Fut>(policy: RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= policy.attempts => return Err(e),
            Err(e) => {
                let delay = policy.delay_after(attempt);
                tracing::warn!(
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "{} failed; retrying",
                    what
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
