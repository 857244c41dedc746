//! Backoff policies shared by the pipeline stages.
//!
//! Stage retries use jittered exponential backoff (base 200 ms, factor 2,
//! at most 5 attempts, delays capped at 5 s). The log watcher's reconnect
//! loop uses a fixed schedule instead, capped at its last entry.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

use crate::error::{Error, Result};

/// Jittered exponential backoff policy.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub base: Duration,
    pub factor: u32,
    pub max_attempts: u32,
    pub max_delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(200),
            factor: 2,
            max_attempts: 5,
            max_delay: Duration::from_secs(5),
        }
    }
}

impl Backoff {
    /// Delay before the given attempt (0-based), with full jitter applied:
    /// uniform over `0..=exponential`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.factor.saturating_pow(attempt);
        let raw = self.base.saturating_mul(exp).min(self.max_delay);
        let jitter_ms = rand::thread_rng().gen_range(0..=raw.as_millis() as u64);
        Duration::from_millis(jitter_ms)
    }
}

/// Fixed reconnect schedule in seconds; past the end the last entry repeats.
#[derive(Debug, Clone)]
pub struct FixedSchedule {
    schedule: Vec<u64>,
}

impl FixedSchedule {
    pub fn new(schedule: Vec<u64>) -> Self {
        let schedule = if schedule.is_empty() { vec![1] } else { schedule };
        Self { schedule }
    }

    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let idx = attempt.min(self.schedule.len() - 1);
        Duration::from_secs(self.schedule[idx])
    }
}

/// Retry an operation while it fails with a transient error.
///
/// Non-transient failures are returned immediately; the final transient
/// failure is returned after `max_attempts` tries.
pub async fn retry_transient<T, F, Fut>(policy: &Backoff, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error: Option<Error> = None;
    for attempt in 0..policy.max_attempts {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() => {
                tracing::debug!(
                    attempt,
                    error_code = ?err.code,
                    "transient failure, backing off"
                );
                let delay = policy.delay_for_attempt(attempt);
                last_error = Some(err);
                if attempt + 1 < policy.max_attempts {
                    tokio::time::sleep(delay).await;
                }
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_error.unwrap_or_else(|| Error::internal("retry loop exited without an error")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delays_are_capped() {
        let policy = Backoff::default();
        for attempt in 0..10 {
            assert!(policy.delay_for_attempt(attempt) <= policy.max_delay);
        }
    }

    #[test]
    fn fixed_schedule_repeats_last_entry() {
        let schedule = FixedSchedule::new(vec![1, 2, 5, 10, 30]);
        assert_eq!(schedule.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(schedule.delay_for_attempt(4), Duration::from_secs(30));
        assert_eq!(schedule.delay_for_attempt(99), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let attempts = AtomicU32::new(0);
        let policy = Backoff {
            base: Duration::from_millis(1),
            ..Backoff::default()
        };

        let result = retry_transient(&policy, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::new(ErrorCode::NetworkTimeout, "flaky"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn validation_errors_are_not_retried() {
        let attempts = AtomicU32::new(0);
        let policy = Backoff::default();

        let result: Result<()> = retry_transient(&policy, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::new(ErrorCode::MalformedRecord, "bad record")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_returns_last_transient_error() {
        let policy = Backoff {
            base: Duration::from_millis(1),
            max_attempts: 3,
            ..Backoff::default()
        };

        let result: Result<()> = retry_transient(&policy, || async {
            Err(Error::new(ErrorCode::UpstreamError, "still down"))
        })
        .await;

        assert_eq!(result.unwrap_err().code, ErrorCode::UpstreamError);
    }
}
