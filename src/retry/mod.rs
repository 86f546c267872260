//! Opt-in retry loop for fallible async operations.
//!
//! A [`Retrier`] owns the operation, an attempt counter, an optional attempt
//! limit, an interval function, and an optional allow-list of retryable
//! errors. [`retry`] drives it until success, until the retrier gives up, or
//! until the context ends.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::context::{Context, ContextError};

/// Computes the wait before the next attempt from the number of attempts
/// made so far.
pub type IntervalFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

type RetryPredicate<E> = Box<dyn Fn(&E) -> bool + Send + Sync>;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Retry state for one operation.
///
/// Defaults: unlimited attempts, a fixed one-second interval, and every error
/// retryable.
pub struct Retrier<E, F> {
    attempt: u32,
    max_retries: Option<u32>,
    interval: IntervalFn,
    retry_on: Vec<RetryPredicate<E>>,
    operation: F,
}

impl<E, F> fmt::Debug for Retrier<E, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retrier")
            .field("attempt", &self.attempt)
            .field("max_retries", &self.max_retries)
            .field("retry_on", &self.retry_on.len())
            .finish_non_exhaustive()
    }
}

impl<E, F> Retrier<E, F> {
    /// Wraps `operation` with the default policy.
    pub fn new(operation: F) -> Self {
        Self {
            attempt: 0,
            max_retries: None,
            interval: interval_fixed(DEFAULT_INTERVAL),
            retry_on: Vec::new(),
            operation,
        }
    }

    /// Caps the total number of attempts at `attempts`.
    #[must_use]
    pub const fn max_retries(mut self, attempts: u32) -> Self {
        self.max_retries = Some(attempts);
        self
    }

    /// Replaces the interval function.
    #[must_use]
    pub fn interval(mut self, interval: IntervalFn) -> Self {
        self.interval = interval;
        self
    }

    /// Adds a predicate; once any predicate is registered only errors
    /// matching one of them are retried.
    #[must_use]
    pub fn retry_on(mut self, predicate: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        self.retry_on.push(Box::new(predicate));
        self
    }

    /// Number of attempts made so far.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Reports whether another attempt is allowed after `last_error`.
    ///
    /// Returns `false` once the attempt limit is reached or when an allow-list
    /// is configured and `last_error` matches none of its entries.
    #[must_use]
    pub fn should_retry(&self, last_error: &E) -> bool {
        if self.max_retries.is_some_and(|limit| self.attempt >= limit) {
            return false;
        }
        self.retry_on.is_empty() || self.retry_on.iter().any(|matches| matches(last_error))
    }

    /// Runs the operation once and counts the attempt.
    ///
    /// # Errors
    ///
    /// Returns the operation's error unchanged.
    pub async fn run<T, Fut>(&mut self) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.attempt = self.attempt.saturating_add(1);
        (self.operation)().await
    }

    fn wait_before_next(&self) -> Duration {
        (self.interval)(self.attempt)
    }
}

impl<E, F> Retrier<E, F>
where
    E: PartialEq + Send + Sync + 'static,
{
    /// Retries only errors equal to `error`, in addition to any other
    /// allow-list entries.
    #[must_use]
    pub fn retry_on_error(self, error: E) -> Self {
        self.retry_on(move |candidate| *candidate == error)
    }
}

/// Failure of a retried operation: every attempt's error by attempt number,
/// and the context error when cancellation or a deadline ended the loop.
#[derive(Debug)]
pub struct RetryError<E> {
    attempts: Vec<(u32, E)>,
    context: Option<ContextError>,
}

impl<E> RetryError<E> {
    /// Errors of the attempts made, in order, keyed by attempt number.
    #[must_use]
    pub fn attempts(&self) -> &[(u32, E)] {
        &self.attempts
    }

    /// The error of the final attempt, if any attempt ran.
    #[must_use]
    pub fn last(&self) -> Option<&E> {
        self.attempts.last().map(|(_, err)| err)
    }

    /// The context error that stopped the loop, if any.
    #[must_use]
    pub const fn context(&self) -> Option<ContextError> {
        self.context
    }

    /// Consumes the error, returning the per-attempt errors.
    #[must_use]
    pub fn into_attempts(self) -> Vec<(u32, E)> {
        self.attempts
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (attempt, err) in &self.attempts {
            if !first {
                writeln!(f)?;
            }
            first = false;
            write!(f, "attempt {attempt}: {err}")?;
        }
        if let Some(context) = self.context {
            if !first {
                writeln!(f)?;
            }
            write!(f, "{context}")?;
        }
        Ok(())
    }
}

impl<E> std::error::Error for RetryError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.last().map(|err| err as &(dyn std::error::Error + 'static))
    }
}

/// Runs the retrier's operation until it succeeds or the retrier gives up.
///
/// The context is checked before every attempt and observed while sleeping
/// between attempts; an attempt already in progress is not interrupted.
///
/// # Errors
///
/// Returns a [`RetryError`] holding every attempt's error, plus the context
/// error when cancellation or a deadline ended the loop.
pub async fn retry<T, E, F, Fut>(
    ctx: &Context,
    retrier: &mut Retrier<E, F>,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let mut attempts = Vec::new();
    loop {
        if let Err(context) = ctx.check() {
            return Err(RetryError {
                attempts,
                context: Some(context),
            });
        }

        let err = match retrier.run().await {
            Ok(value) => {
                debug!(attempt = retrier.attempt(), "operation succeeded");
                return Ok(value);
            }
            Err(err) => err,
        };
        let attempt = retrier.attempt();
        let again = retrier.should_retry(&err);
        warn!(attempt, retrying = again, error = %err, "attempt failed");
        attempts.push((attempt, err));
        if !again {
            return Err(RetryError {
                attempts,
                context: None,
            });
        }

        let wait = retrier.wait_before_next();
        debug!(attempt, wait_ms = wait.as_millis(), "waiting before next attempt");
        tokio::select! {
            () = sleep(wait) => {}
            context = ctx.done() => {
                return Err(RetryError {
                    attempts,
                    context: Some(context),
                });
            }
        }
    }
}

/// Waits `interval` between attempts; zero before the first.
#[must_use]
pub fn interval_fixed(interval: Duration) -> IntervalFn {
    Arc::new(move |attempt| {
        if attempt == 0 {
            Duration::ZERO
        } else {
            interval
        }
    })
}

/// Waits `base * 2^attempt`; zero before the first attempt.
#[must_use]
pub fn interval_exponential(base: Duration) -> IntervalFn {
    Arc::new(move |attempt| {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2_u32.checked_pow(attempt).unwrap_or(u32::MAX);
        base.saturating_mul(factor)
    })
}

/// Waits `base * fib(attempt)` with `fib(0) = 0` and `fib(1) = fib(2) = 1`.
#[must_use]
pub fn interval_fibonacci(base: Duration) -> IntervalFn {
    Arc::new(move |attempt| base.saturating_mul(fibonacci(attempt)))
}

fn fibonacci(n: u32) -> u32 {
    let (mut current, mut next) = (0_u32, 1_u32);
    for _ in 0..n {
        let sum = current.saturating_add(next);
        current = next;
        next = sum;
    }
    current
}
