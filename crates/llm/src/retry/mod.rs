//! Bounded retry with exponential backoff for provider calls.
//!
//! A call is attempted at most `max_attempts` times. After the n-th failed
//! attempt (1-based) the wait before the next one is
//! `clamp(multiplier * 2^(n-1) seconds, min_delay, max_delay)`, so the delays
//! never decrease and always stay within the bounds.
//!
//! ```ignore
//! let policy = RetryPolicy::from_settings(&config.retry);
//! let reply = execute_with_retry(&policy, &cancel, |attempt| async move {
//!     adapter.complete(&request).await
//! })
//! .await?;
//! ```

use common::{ProviderError, RetrySettings};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Retry schedule for one logical call.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub multiplier: f64,
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// Randomize each delay within `[min_delay, computed]`
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            multiplier: 1.0,
            min_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            multiplier: settings.multiplier,
            min_delay: Duration::from_secs_f64(settings.min_delay_seconds.max(0.0)),
            max_delay: Duration::from_secs_f64(settings.max_delay_seconds.max(0.0)),
            jitter: false,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_delay_bounds(mut self, min_delay: Duration, max_delay: Duration) -> Self {
        self.min_delay = min_delay;
        self.max_delay = max_delay.max(min_delay);
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Wait after the `failed_attempt`-th failure (1-based).
    pub fn delay_for_attempt(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(62) as i32;
        let raw = self.multiplier * 2f64.powi(exponent);
        let secs = raw
            .max(self.min_delay.as_secs_f64())
            .min(self.max_delay.as_secs_f64());
        let delay = Duration::from_secs_f64(secs);

        if self.jitter && delay > self.min_delay {
            let low = self.min_delay.as_secs_f64();
            let jittered = rand::thread_rng().gen_range(low..=delay.as_secs_f64());
            return Duration::from_secs_f64(jittered);
        }
        delay
    }
}

/// Errors that can tell whether another attempt might succeed.
pub trait RetryableError {
    fn is_retryable(&self) -> bool;

    fn error_type(&self) -> String;
}

impl RetryableError for ProviderError {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }

    fn error_type(&self) -> String {
        self.kind.as_str().to_string()
    }
}

/// Why a retried call finally failed.
#[derive(Debug)]
pub enum RetryFailure<E> {
    /// Every attempt failed with a retryable error.
    Exhausted { attempts: u32, last_error: E },
    /// An attempt failed with an error that retrying cannot fix.
    NonRetryable(E),
    Cancelled,
}

impl<E> RetryFailure<E> {
    pub fn into_last_error(self) -> Option<E> {
        match self {
            RetryFailure::Exhausted { last_error, .. } => Some(last_error),
            RetryFailure::NonRetryable(e) => Some(e),
            RetryFailure::Cancelled => None,
        }
    }
}

impl<E: std::fmt::Display> std::fmt::Display for RetryFailure<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryFailure::Exhausted { attempts, last_error } => {
                write!(f, "gave up after {} attempts: {}", attempts, last_error)
            }
            RetryFailure::NonRetryable(e) => write!(f, "non-retryable failure: {}", e),
            RetryFailure::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Run `operation` until it succeeds, fails permanently, runs out of attempts
/// or `cancel` fires. The attempt number (1-based) is passed to `operation`.
pub async fn execute_with_retry<F, Fut, T, E>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, RetryFailure<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryableError + std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryFailure::Cancelled);
        }

        debug!("Attempt {}/{}", attempt, max_attempts);

        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(RetryFailure::Cancelled),
            result = operation(attempt) => result,
        };

        match result {
            Ok(value) => {
                if attempt > 1 {
                    info!("Operation succeeded after {} attempts", attempt);
                }
                return Ok(value);
            }
            Err(error) if !error.is_retryable() => {
                warn!(
                    "Operation failed with non-retryable {} error: {}",
                    error.error_type(),
                    error
                );
                return Err(RetryFailure::NonRetryable(error));
            }
            Err(error) if attempt >= max_attempts => {
                warn!(
                    "Operation failed after {} attempts: {}",
                    attempt, error
                );
                return Err(RetryFailure::Exhausted {
                    attempts: attempt,
                    last_error: error,
                });
            }
            Err(error) => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    "Attempt {}/{} failed ({}), retrying in {:?}: {}",
                    attempt,
                    max_attempts,
                    error.error_type(),
                    delay,
                    error
                );

                tokio::select! {
                    _ = cancel.cancelled() => return Err(RetryFailure::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::ProviderErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    fn transient() -> ProviderError {
        ProviderError::from_status("primary", 503, "unavailable")
    }

    #[test]
    fn test_delays_are_bounded_and_non_decreasing() {
        let policy = RetryPolicy::default();
        let delays: Vec<Duration> = (1..=8).map(|n| policy.delay_for_attempt(n)).collect();

        assert_eq!(delays[0], Duration::from_secs(2));
        assert_eq!(delays[1], Duration::from_secs(2));
        assert_eq!(delays[2], Duration::from_secs(4));
        assert_eq!(delays[3], Duration::from_secs(8));
        assert_eq!(delays[4], Duration::from_secs(10));
        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        for d in &delays {
            assert!(*d >= Duration::from_secs(2) && *d <= Duration::from_secs(10));
        }
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::default().with_jitter(true);
        for n in 1..=10 {
            let d = policy.delay_for_attempt(n);
            assert!(d >= policy.min_delay && d <= policy.max_delay);
        }
    }

    #[test]
    fn test_from_settings() {
        let policy = RetryPolicy::from_settings(&RetrySettings::default());
        assert_eq!(policy, RetryPolicy::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_at_most_three_attempts_with_backoff() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();
        let cancel = CancellationToken::new();

        let recorded = calls.clone();
        let result: Result<(), _> = execute_with_retry(&RetryPolicy::default(), &cancel, |_| {
            let recorded = recorded.clone();
            async move {
                recorded.lock().unwrap().push(start.elapsed());
                Err(transient())
            }
        })
        .await;

        match result {
            Err(RetryFailure::Exhausted { attempts, last_error }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error.kind, ProviderErrorKind::Server);
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(gaps[0] >= Duration::from_secs(2));
        assert!(gaps[1] >= gaps[0]);
        assert!(gaps.iter().all(|g| *g <= Duration::from_secs(11)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_on_second_attempt() {
        let attempts = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result = execute_with_retry(&RetryPolicy::default(), &cancel, |n| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(transient())
                } else {
                    Ok("ok")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_immediately() {
        let attempts = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result: Result<(), _> = execute_with_retry(&RetryPolicy::default(), &cancel, |_| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::from_status("openai", 400, "bad request")) }
        })
        .await;

        assert!(matches!(result, Err(RetryFailure::NonRetryable(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_backoff() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });

        let result: Result<(), _> =
            execute_with_retry(&RetryPolicy::default(), &cancel, |_| async { Err(transient()) })
                .await;

        assert!(matches!(result, Err(RetryFailure::Cancelled)));
    }
}
