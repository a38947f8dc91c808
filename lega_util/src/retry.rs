use backoff::backoff::{Backoff as BackoffPolicy, Constant};
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

/// Classifies errors into those worth retrying (transient transport
/// failures) and those that must propagate immediately.
pub trait Retryable {
    /// Reports whether a repeated attempt has a chance of succeeding.
    fn is_retryable(&self) -> bool;
}

/// Wraps a fallible asynchronous operation with a bounded number of
/// attempts separated by a fixed interval.
///
/// Retryable errors (as judged by [`Retryable`]) are swallowed until the
/// attempts are exhausted, at which point the `on_failure` hook runs once
/// and the last error propagates. Non-retryable errors propagate
/// immediately, without invoking the hook.
///
/// The defaults (30 attempts, 1 second apart) match the broker and
/// database connection knobs (`try` / `try_interval`).
#[derive(Debug, Clone)]
pub struct Retry {
    name: String,
    attempts: u32,
    interval: Duration,
}

impl Retry {
    /// The default number of attempts.
    pub const DEFAULT_ATTEMPTS: u32 = 30;

    /// The default interval between attempts.
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

    /// Creates a new [`Retry`] with the given name (used in logging), number
    /// of attempts, and interval between attempts.
    ///
    /// At least one attempt is always made, even if `attempts` is zero.
    pub fn new(name: impl AsRef<str>, attempts: u32, interval: Duration) -> Self {
        Self {
            name: name.as_ref().to_string(),
            attempts: attempts.max(1),
            interval,
        }
    }

    /// Creates a new [`Retry`] with the default attempt count and interval.
    pub fn with_defaults(name: impl AsRef<str>) -> Self {
        Self::new(name, Self::DEFAULT_ATTEMPTS, Self::DEFAULT_INTERVAL)
    }

    /// Reports the name of this retry wrapper.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs the given operation until it succeeds, until a non-retryable
    /// error occurs, or until the attempts are exhausted.
    pub async fn run<T, E, F, Fut, H>(&self, mut operation: F, on_failure: H) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + std::fmt::Display,
        H: FnOnce(),
    {
        // The backoff crate supplies the constant sleeping policy
        let mut policy = Constant::new(self.interval);

        let mut attempt = 0;
        loop {
            attempt += 1;

            // Make an attempt
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            // Non-retryable errors propagate right away
            if !error.is_retryable() {
                return Err(error);
            }

            // Check whether any attempts remain
            if attempt >= self.attempts {
                error!(
                    name = self.name.as_str(),
                    attempts = self.attempts,
                    error_message = %error,
                    "Giving up after exhausting all attempts",
                );

                on_failure();

                return Err(error);
            }

            // Report and wait out the interval
            warn!(
                name = self.name.as_str(),
                attempt,
                attempts = self.attempts,
                error_message = %error,
                "Attempt failed; retrying",
            );

            let delay = policy.next_backoff().unwrap_or(self.interval);
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::cell::Cell;
    use thiserror::Error;

    #[derive(Debug, Error)]
    enum TestError {
        #[error("transient")]
        Transient,
        #[error("permanent")]
        Permanent,
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            matches!(self, TestError::Transient)
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        // Given
        let calls = Cell::new(0);
        let retry = Retry::new("test", 5, Duration::from_millis(1));

        // When
        let result = retry
            .run(
                || {
                    calls.set(calls.get() + 1);
                    let outcome = if calls.get() < 3 {
                        Err(TestError::Transient)
                    } else {
                        Ok(42)
                    };
                    async move { outcome }
                },
                || panic!("on_failure must not run"),
            )
            .await;

        // Then
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn exhaustion_invokes_hook_and_propagates() {
        // Given
        let calls = Cell::new(0);
        let failed = Cell::new(false);
        let retry = Retry::new("test", 3, Duration::from_millis(1));

        // When
        let result: Result<(), _> = retry
            .run(
                || {
                    calls.set(calls.get() + 1);
                    async { Err(TestError::Transient) }
                },
                || failed.set(true),
            )
            .await;

        // Then
        assert!(result.is_err());
        assert!(failed.get());
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn permanent_error_propagates_immediately() {
        // Given
        let calls = Cell::new(0);
        let retry = Retry::new("test", 5, Duration::from_millis(1));

        // When
        let result: Result<(), _> = retry
            .run(
                || {
                    calls.set(calls.get() + 1);
                    async { Err(TestError::Permanent) }
                },
                || panic!("on_failure must not run"),
            )
            .await;

        // Then
        assert!(matches!(result, Err(TestError::Permanent)));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn zero_attempts_still_tries_once() {
        // Given
        let retry = Retry::new("test", 0, Duration::from_millis(1));

        // When
        let result = retry
            .run(|| async { Ok::<_, TestError>("done") }, || {})
            .await;

        // Then
        assert_eq!(result.unwrap(), "done");
    }
}
