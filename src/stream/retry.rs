//! Usage: Retry policy for persisting interrupted responses (attempt count + fixed/exponential delay).

use crate::settings::{ClientSettings, RetryBackoff};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub backoff: RetryBackoff,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(1000),
            backoff: RetryBackoff::Fixed,
            max_delay: Duration::from_millis(10_000),
        }
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &ClientSettings) -> Self {
        Self {
            max_attempts: settings.save_retry_max_attempts.max(1),
            delay: Duration::from_millis(settings.save_retry_delay_ms),
            backoff: settings.save_retry_backoff,
            max_delay: Duration::from_millis(
                settings.save_retry_max_delay_ms.max(settings.save_retry_delay_ms),
            ),
        }
    }

    /// Delay after the failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            RetryBackoff::Fixed => self.delay,
            RetryBackoff::Exponential => {
                let shift = attempt.saturating_sub(1).min(16);
                self.delay
                    .checked_mul(1u32 << shift)
                    .unwrap_or(self.max_delay)
                    .min(self.max_delay)
            }
        }
    }

    /// Runs `op` until it succeeds or attempts run out; returns the last error.
    pub async fn run<T, F, Fut>(&self, label: &'static str, mut op: F) -> Result<T, String>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, String>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= max_attempts => {
                    tracing::error!(label = label, attempt = attempt, "重试次数耗尽: {}", err);
                    return Err(err);
                }
                Err(err) => {
                    let delay = self.delay_after(attempt);
                    tracing::warn!(
                        label = label,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        "操作失败，准备重试: {}",
                        err
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
