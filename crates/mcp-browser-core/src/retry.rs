//! Retry policy with exponential backoff.
//!
//! A [`RetryPolicy`] decides whether a failed attempt should be retried and
//! how long to wait first. [`RetryPolicy::execute`] drives an async
//! operation; [`RetryPolicy::execute_blocking`] drives a synchronous one
//! with the same algorithm, sleeping the current thread between attempts.

use std::error::Error as StdError;
use std::future::Future;
use std::time::Duration;

use tracing::{error, warn};

use crate::config::RetryConfig;
use crate::error::{BrowserError, ErrorKind, Result};

/// Kinds retried when no explicit set is configured.
pub const DEFAULT_RETRYABLE_KINDS: [ErrorKind; 3] = [
    ErrorKind::Timeout,
    ErrorKind::NetworkError,
    ErrorKind::RateLimited,
];

type CauseMatcher = fn(&(dyn StdError + 'static)) -> bool;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    backoff_factor: f64,
    retryable_kinds: Vec<ErrorKind>,
    retryable_causes: Vec<CauseMatcher>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
            retryable_kinds: DEFAULT_RETRYABLE_KINDS.to_vec(),
            retryable_causes: Vec::new(),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::default()
            .with_max_attempts(config.max_attempts)
            .with_initial_delay(config.initial_delay())
            .with_max_delay(config.max_delay())
            .with_backoff_factor(config.backoff_factor)
            .with_retryable_kinds(config.retryable_kinds.iter().copied())
    }
}

impl RetryPolicy {
    /// Same as [`RetryPolicy::default`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Total invocations allowed, including the first. Clamped to at least 1.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Delay before the first retry.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Upper bound on any single backoff delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Multiplier applied to the delay after each failed attempt.
    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Replace the retryable kind set.
    pub fn with_retryable_kinds(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retryable_kinds = kinds.into_iter().collect();
        self
    }

    /// Add one kind to the retryable set.
    pub fn retry_on_kind(mut self, kind: ErrorKind) -> Self {
        if !self.retryable_kinds.contains(&kind) {
            self.retryable_kinds.push(kind);
        }
        self
    }

    /// Treat failures caused by an `E` (anywhere in the cause chain) as
    /// retryable, whatever their kind.
    pub fn retry_on_cause<E>(mut self) -> Self
    where
        E: StdError + 'static,
    {
        self.retryable_causes.push(cause_is::<E>);
        self
    }

    /// Total invocations allowed, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Kinds that are retried.
    pub fn retryable_kinds(&self) -> &[ErrorKind] {
        &self.retryable_kinds
    }

    /// Whether attempt number `attempt` (1-based) failing with `err` should
    /// be followed by another attempt.
    pub fn should_retry(&self, err: &BrowserError, attempt: u32) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }
        if self.cause_registered(err) {
            return true;
        }
        self.retryable_kinds.contains(&err.kind())
    }

    /// Backoff before the next try: `initial * factor^(attempt-1)`, capped at
    /// the max delay.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay)
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or runs out of attempts. The terminal error is the last one returned
    /// by `operation`, with `details.attempts` recording the invocation count.
    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let delay = self.next_delay(err, attempt)?;
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Blocking counterpart of [`execute`](Self::execute).
    pub fn execute_blocking<T, F>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut attempt = 1;
        loop {
            match operation() {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let delay = self.next_delay(err, attempt)?;
                    std::thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }

    fn next_delay(&self, err: BrowserError, attempt: u32) -> Result<Duration> {
        if !self.should_retry(&err, attempt) {
            error!(
                attempts = attempt,
                code = %err.kind(),
                "Operation failed after {attempt} attempt(s): {}",
                err.message()
            );
            return Err(err.with_detail("attempts", attempt));
        }

        let delay = self.delay_for(attempt);
        warn!(
            attempt,
            max_attempts = self.max_attempts,
            delay_ms = delay.as_millis() as u64,
            code = %err.kind(),
            "Retrying after failure: {}",
            err.message()
        );
        Ok(delay)
    }

    fn cause_registered(&self, err: &BrowserError) -> bool {
        if self.retryable_causes.is_empty() {
            return false;
        }
        let mut current = err.cause().map(|c| c as &(dyn StdError + 'static));
        while let Some(cause) = current {
            if self.retryable_causes.iter().any(|matches| matches(cause)) {
                return true;
            }
            current = cause.source();
        }
        false
    }
}

fn cause_is<E: StdError + 'static>(err: &(dyn StdError + 'static)) -> bool {
    err.is::<E>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn instant_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new()
            .with_max_attempts(max_attempts)
            .with_initial_delay(Duration::ZERO)
            .with_max_delay(Duration::ZERO)
    }

    #[test]
    fn test_delay_table() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for(3), Duration::from_secs(2));
        assert_eq!(policy.delay_for(4), Duration::from_secs(4));
        assert_eq!(policy.delay_for(5), Duration::from_secs(5));
        assert_eq!(policy.delay_for(500), Duration::from_secs(5));
    }

    #[test]
    fn test_should_retry_kinds() {
        let policy = RetryPolicy::default();
        for kind in DEFAULT_RETRYABLE_KINDS {
            assert!(policy.should_retry(&BrowserError::new(kind, "x"), 1));
        }
        let exhausted = BrowserError::new(ErrorKind::ResourceExhausted, "full");
        assert!(!policy.should_retry(&exhausted, 1));
        let internal = BrowserError::new(ErrorKind::InternalError, "bug");
        assert!(!policy.should_retry(&internal, 1));
    }

    #[test]
    fn test_should_retry_stops_at_max_attempts() {
        let policy = RetryPolicy::default();
        let err = BrowserError::new(ErrorKind::Timeout, "slow");
        assert!(policy.should_retry(&err, 2));
        assert!(!policy.should_retry(&err, 3));
        assert!(!policy.should_retry(&err, 4));
    }

    #[test]
    fn test_registered_cause_is_retryable() {
        let policy = RetryPolicy::default().retry_on_cause::<std::io::Error>();
        let err = BrowserError::wrap(std::io::Error::other("reset"));
        assert_eq!(err.kind(), ErrorKind::InternalError);
        assert!(policy.should_retry(&err, 1));
        assert!(!RetryPolicy::default().should_retry(&err, 1));
    }

    #[test]
    fn test_retry_on_kind_extends_set() {
        let policy = RetryPolicy::default().retry_on_kind(ErrorKind::ResourceExhausted);
        let err = BrowserError::new(ErrorKind::ResourceExhausted, "full");
        assert!(policy.should_retry(&err, 1));
        assert_eq!(policy.retryable_kinds().len(), 4);
    }

    #[test]
    fn test_max_attempts_clamped() {
        assert_eq!(RetryPolicy::new().with_max_attempts(0).max_attempts(), 1);
    }

    #[tokio::test]
    async fn test_succeeds_on_last_attempt() {
        let policy = instant_policy(3);
        let calls = AtomicU32::new(0);

        let result = policy
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(BrowserError::new(
                            ErrorKind::NetworkError,
                            format!("Network error (attempt {n})"),
                        ))
                    } else {
                        Ok("Success after retries")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "Success after retries");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_once() {
        let policy = instant_policy(3);
        let calls = AtomicU32::new(0);

        let err = policy
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(BrowserError::new(ErrorKind::InvalidUrl, "no scheme")) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.kind(), ErrorKind::InvalidUrl);
        assert_eq!(err.message(), "no scheme");
        assert_eq!(err.details().unwrap()["attempts"], 1);
    }

    #[tokio::test]
    async fn test_exhaustion_keeps_original_kind() {
        let policy = instant_policy(4);
        let calls = AtomicU32::new(0);

        let err = policy
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(BrowserError::new(ErrorKind::Timeout, "still slow")) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.details().unwrap()["attempts"], 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_suspends_for_delay() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let _ = policy
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(BrowserError::new(ErrorKind::RateLimited, "slow down")) }
            })
            .await;

        // 0.5s + 1.0s between the three attempts
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(1500), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(1600), "{elapsed:?}");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_blocking_executor() {
        let policy = instant_policy(3);
        let mut calls = 0;

        let value = policy
            .execute_blocking(|| {
                calls += 1;
                if calls < 2 {
                    Err(BrowserError::new(ErrorKind::Timeout, "slow"))
                } else {
                    Ok(calls)
                }
            })
            .unwrap();

        assert_eq!(value, 2);
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_from_config() {
        let config = RetryConfig {
            max_attempts: 5,
            initial_delay_secs: 0.1,
            max_delay_secs: 1.0,
            backoff_factor: 3.0,
            retryable_kinds: vec![ErrorKind::Timeout],
        };
        let policy = RetryPolicy::from(&config);
        assert_eq!(policy.max_attempts(), 5);
        assert_eq!(policy.retryable_kinds(), &[ErrorKind::Timeout]);
        assert!((policy.delay_for(3).as_secs_f64() - 0.9).abs() < 1e-6);
        assert_eq!(policy.delay_for(4), Duration::from_secs(1));
    }
}
