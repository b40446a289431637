//! Bounded exponential backoff for network operations.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::config::EngineConfig;
use crate::errors::{BackupError, Result};

const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Applied on top of the exponential delay when the remote side throttles us.
    pub rate_limit_multiplier: u32,
}

impl RetryPolicy {
    pub fn from_engine(engine: &EngineConfig) -> Self {
        RetryPolicy {
            max_attempts: engine.max_attempts,
            base_delay: engine.retry_base_delay,
            rate_limit_multiplier: engine.rate_limit_backoff_multiplier.max(1),
        }
    }

    /// Delay to wait after the failed `attempt` (1-based). A server-supplied
    /// `Retry-After` wins over the computed backoff.
    pub fn delay_for(&self, attempt: u32, err: &BackupError) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        match err {
            BackupError::RateLimited {
                retry_after: Some(hint),
                ..
            } => *hint,
            BackupError::RateLimited { .. } => delay.saturating_mul(self.rate_limit_multiplier),
            _ => delay,
        }
    }
}

/// Parses a `Retry-After` value: delta seconds or an HTTP date. Hints beyond
/// an hour, dates in the past and unparseable values are ignored.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    let hint = if let Ok(seconds) = value.parse::<u64>() {
        Duration::from_secs(seconds)
    } else {
        let date = chrono::DateTime::parse_from_rfc2822(value).ok()?;
        (date.with_timezone(&chrono::Utc) - chrono::Utc::now()).to_std().ok()?
    };
    (hint <= MAX_RETRY_AFTER).then_some(hint)
}

/// Runs `op` until it succeeds, returns a non-retryable error, or the attempt
/// bound is exhausted. The closure receives the 1-based attempt number.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt, &e);
                warn!(
                    operation,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying after failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
