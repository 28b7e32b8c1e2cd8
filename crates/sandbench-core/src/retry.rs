//! Exponential-backoff retry.

use std::future::Future;
use std::time::Duration;

/// Retry schedule for network-facing calls.
///
/// The first attempt runs immediately. After each failure the policy
/// sleeps, starting at `initial_delay` and multiplying by `multiplier`
/// up to `max_delay`, until `max_retries` retries have been spent.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Outcome of an exhausted retry loop.
#[derive(Debug)]
pub struct RetryError<E> {
    /// Total attempts made, including the first
    pub attempts: u32,
    /// Error returned by the last attempt
    pub last: E,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            ..Default::default()
        }
    }

    /// Delay before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(retry.min(i32::MAX as u32) as i32);
        let delay = self.initial_delay.as_secs_f64() * factor;
        if delay >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(delay)
        }
    }

    /// Run `op` until it succeeds or the retries are spent.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(attempts = attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if attempt > self.max_retries => {
                    tracing::debug!(attempts = attempt, error = %e, "Retries exhausted");
                    return Err(RetryError { attempts: attempt, last: e });
                }
                Err(e) => {
                    let delay = self.delay_for(attempt - 1);
                    tracing::trace!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
