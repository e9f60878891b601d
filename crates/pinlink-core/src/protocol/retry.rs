//! Retry policies for port opening and identification

use std::future::Future;
use std::time::Duration;
use tracing::debug;

use super::ProtocolError;

/// Fixed-delay retry policy, bounded or unbounded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    delay: Duration,
    max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Retry forever with a fixed delay between attempts
    pub fn unbounded(delay: Duration) -> Self {
        Self {
            delay,
            max_attempts: None,
        }
    }

    /// Give up after `max_attempts` attempts (at least one attempt is made)
    pub fn bounded(max_attempts: u32, delay: Duration) -> Self {
        Self {
            delay,
            max_attempts: Some(max_attempts.max(1)),
        }
    }

    /// Single attempt, no retries
    pub fn once() -> Self {
        Self::bounded(1, Duration::ZERO)
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    /// Whether another attempt may follow `attempts` failed ones
    pub fn should_retry(&self, attempts: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts < max)
    }

    /// Run `op` until it succeeds, fails permanently, or the policy is exhausted
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, ProtocolError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProtocolError>>,
    {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && self.should_retry(attempts) => {
                    debug!("{} failed (attempt {}): {}. Will retry.", what, attempts, e);
                    tokio::time::sleep(self.delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
