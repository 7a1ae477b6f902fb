//! Bounded retries with exponential backoff around one fallible operation.
//!
//! Every invocation of [`RetryController::execute`] starts a fresh attempt
//! budget. Failures are retried until the budget is spent, except those the
//! error type marks fatal, which end the invocation at once. Backoff sleeps
//! block the calling thread and are cut short by a [`CancelToken`].

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::core::backoff::backoff_delay;

/// Classification hooks the controller uses to label and route failures.
pub trait Retryable {
    /// Timeout-class failures are retried like any other but logged distinctly.
    fn is_timeout(&self) -> bool {
        false
    }

    /// Fatal failures end the invocation without another attempt.
    fn is_fatal(&self) -> bool {
        false
    }
}

/// Attempt budget and backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first; values below 1 are treated as 1.
    pub max_attempts: u32,
    /// Delay after failed attempt `n` is `backoff_base^n` units.
    pub backoff_base: u32,
    pub unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: 2,
            unit: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_base: u32) -> Self {
        Self {
            max_attempts,
            backoff_base,
            ..Self::default()
        }
    }

    pub fn with_unit(self, unit: Duration) -> Self {
        Self { unit, ..self }
    }

    /// Delay slept after failed attempt `attempt` (1-indexed).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        backoff_delay(self.backoff_base, attempt, self.unit)
    }

    fn attempt_limit(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Shared flag that aborts an invocation before its next attempt or mid-sleep.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Blocking delay between attempts.
pub trait Sleeper {
    /// Sleep for `duration` unless `cancel` fires first. Returns `false` when cancelled.
    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> bool;
}

impl<S: Sleeper + ?Sized> Sleeper for &S {
    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> bool {
        (**self).sleep(duration, cancel)
    }
}

/// Sleeps on the current thread, polling the cancel token every `slice`.
#[derive(Debug, Clone, Copy)]
pub struct ThreadSleeper {
    slice: Duration,
}

impl Default for ThreadSleeper {
    fn default() -> Self {
        Self {
            slice: Duration::from_millis(50),
        }
    }
}

impl ThreadSleeper {
    pub fn with_slice(slice: Duration) -> Self {
        Self { slice }
    }
}

impl Sleeper for ThreadSleeper {
    /// A `duration` too large to represent as a deadline sleeps until cancelled.
    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> bool {
        let deadline = Instant::now().checked_add(duration);
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => duration,
            };
            if remaining.is_zero() {
                return true;
            }
            thread::sleep(remaining.min(self.slice));
        }
    }
}

/// Why an invocation ended without a value.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed; carries the last failure.
    Exhausted { attempts: u32, last: E },
    /// A fatal failure stopped the invocation at `attempt`.
    Fatal { attempt: u32, error: E },
    /// The cancel token fired after `attempts` attempts.
    Cancelled { attempts: u32 },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } | RetryError::Cancelled { attempts } => {
                *attempts
            }
            RetryError::Fatal { attempt, .. } => *attempt,
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Exhausted { attempts, last } => {
                write!(f, "gave up after {attempts} attempts: {last}")
            }
            RetryError::Fatal { attempt, error } => {
                write!(f, "attempt {attempt} failed fatally: {error}")
            }
            RetryError::Cancelled { attempts } => {
                write!(f, "cancelled after {attempts} attempts")
            }
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RetryError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RetryError::Exhausted { last, .. } => Some(last),
            RetryError::Fatal { error, .. } => Some(error),
            RetryError::Cancelled { .. } => None,
        }
    }
}

/// Runs an operation under a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryController<S = ThreadSleeper> {
    policy: RetryPolicy,
    sleeper: S,
    cancel: CancelToken,
}

impl RetryController<ThreadSleeper> {
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_sleeper(policy, ThreadSleeper::default())
    }
}

impl<S: Sleeper> RetryController<S> {
    pub fn with_sleeper(policy: RetryPolicy, sleeper: S) -> Self {
        Self {
            policy,
            sleeper,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel_token(self, cancel: CancelToken) -> Self {
        Self { cancel, ..self }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Invoke `operation` until it succeeds, fails fatally, runs out of attempts,
    /// or is cancelled.
    pub fn execute<T, E, F>(&self, mut operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Result<T, E>,
        E: Retryable + fmt::Display,
    {
        let max_attempts = self.policy.attempt_limit();
        let mut attempt = 1;
        loop {
            if self.cancel.is_cancelled() {
                info!(attempts = attempt - 1, "cancelled before attempt");
                return Err(RetryError::Cancelled {
                    attempts: attempt - 1,
                });
            }

            debug!(attempt, max_attempts, "starting attempt");
            let err = match operation() {
                Ok(value) => {
                    if attempt > 1 {
                        info!(attempt, "attempt succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            let kind = if err.is_timeout() { "timeout" } else { "error" };
            if err.is_fatal() {
                warn!(attempt, kind, error = %err, "attempt failed fatally, not retrying");
                return Err(RetryError::Fatal {
                    attempt,
                    error: err,
                });
            }
            if attempt >= max_attempts {
                warn!(attempt, kind, error = %err, "attempt failed, retries exhausted");
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: err,
                });
            }

            let delay = self.policy.delay_after(attempt);
            warn!(
                attempt,
                max_attempts,
                kind,
                error = %err,
                delay_secs = delay.as_secs_f64(),
                "attempt failed, backing off"
            );
            if !self.sleeper.sleep(delay, &self.cancel) {
                info!(attempts = attempt, "cancelled during backoff");
                return Err(RetryError::Cancelled { attempts: attempt });
            }
            attempt += 1;
        }
    }
}
