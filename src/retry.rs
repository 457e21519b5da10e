//! Retryer Module
//!
//! Executes one caller-supplied asynchronous operation, applying
//! retry/backoff policy, pause/resume on the online signal, and cooperative
//! cancellation. The retryer never force-stops an in-flight operation: the
//! cancellation token is advisory for the operation itself (it receives the
//! token through its fetch context) but aborts backoff and pause waits
//! immediately.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use rand::Rng;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{FetchError, QueryError};

// == Retry Limit ==
/// How many times a failed attempt may be retried.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryLimit {
    /// Never retry; the first failure settles the fetch
    Never,
    /// Retry up to this many times (total attempts = 1 + count)
    Count(u32),
    /// Retry forever (until cancelled)
    Infinite,
}

impl Default for RetryLimit {
    fn default() -> Self {
        RetryLimit::Count(3)
    }
}

// == Retry Delay ==
/// Maps a failure streak to a backoff duration.
#[derive(Clone)]
pub enum RetryDelay {
    /// Constant delay between attempts
    Fixed(Duration),
    /// Exponential backoff: `initial * 2^(n-1)` capped at `max`, optionally
    /// jittered uniformly into `[base/2, base]`
    Exponential {
        initial: Duration,
        max: Duration,
        jitter: bool,
    },
    /// Caller-supplied delay function of (failure_count, error)
    Custom(Arc<dyn Fn(u32, &FetchError) -> Duration + Send + Sync>),
}

impl RetryDelay {
    /// Computes the backoff before the next attempt, given that
    /// `failure_count` attempts have failed so far.
    pub fn duration_for(&self, failure_count: u32, error: &FetchError) -> Duration {
        match self {
            RetryDelay::Fixed(delay) => *delay,
            RetryDelay::Exponential {
                initial,
                max,
                jitter,
            } => {
                let exponent = failure_count.saturating_sub(1).min(31);
                let base = initial
                    .saturating_mul(2u32.saturating_pow(exponent))
                    .min(*max);
                if !*jitter {
                    return base;
                }
                let millis = base.as_millis() as u64;
                if millis == 0 {
                    return base;
                }
                Duration::from_millis(rand::thread_rng().gen_range(millis / 2..=millis))
            }
            RetryDelay::Custom(f) => f(failure_count, error),
        }
    }
}

impl Default for RetryDelay {
    fn default() -> Self {
        RetryDelay::Exponential {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl fmt::Debug for RetryDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryDelay::Fixed(d) => f.debug_tuple("Fixed").field(d).finish(),
            RetryDelay::Exponential {
                initial,
                max,
                jitter,
            } => f
                .debug_struct("Exponential")
                .field("initial", initial)
                .field("max", max)
                .field("jitter", jitter)
                .finish(),
            RetryDelay::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

// == Retry Policy ==
/// Full retry configuration for one fetch or mutation.
#[derive(Clone, Default)]
pub struct RetryPolicy {
    /// Attempt budget
    pub limit: RetryLimit,
    /// Backoff between attempts
    pub delay: RetryDelay,
    /// Optional per-error veto; returning false settles the failure even if
    /// attempts remain
    pub should_retry: Option<Arc<dyn Fn(u32, &FetchError) -> bool + Send + Sync>>,
}

impl RetryPolicy {
    /// Policy that never retries (the mutation-path default).
    pub fn never() -> Self {
        Self {
            limit: RetryLimit::Never,
            ..Self::default()
        }
    }

    /// Policy retrying `count` times with the default backoff.
    pub fn count(count: u32) -> Self {
        Self {
            limit: RetryLimit::Count(count),
            ..Self::default()
        }
    }

    /// Replaces the backoff delay.
    pub fn with_delay(mut self, delay: RetryDelay) -> Self {
        self.delay = delay;
        self
    }

    /// Installs a per-error retry veto.
    pub fn with_should_retry(
        mut self,
        predicate: impl Fn(u32, &FetchError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.should_retry = Some(Arc::new(predicate));
        self
    }

    /// Whether another attempt is allowed after `failure_count` failures.
    pub fn allows_retry(&self, failure_count: u32, error: &FetchError) -> bool {
        let within_budget = match self.limit {
            RetryLimit::Never => false,
            RetryLimit::Count(count) => failure_count.saturating_sub(1) < count,
            RetryLimit::Infinite => true,
        };
        within_budget
            && self
                .should_retry
                .as_ref()
                .map_or(true, |p| p(failure_count, error))
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("limit", &self.limit)
            .field("delay", &self.delay)
            .field("should_retry", &self.should_retry.is_some())
            .finish()
    }
}

// == Fetch Outcome ==
/// Terminal result of a retryer-wrapped operation.
#[derive(Clone, Debug, PartialEq)]
pub enum FetchOutcome {
    /// The operation produced data
    Success(Value),
    /// Attempts exhausted or error ruled non-retryable
    Failure(FetchError),
    /// Cancelled before settling; neutral, not a failure
    Cancelled,
}

impl FetchOutcome {
    /// Converts the outcome into the client-facing result type.
    pub fn into_result(self) -> crate::error::Result<Value> {
        match self {
            FetchOutcome::Success(data) => Ok(data),
            FetchOutcome::Failure(error) => Err(QueryError::Fetch(error)),
            FetchOutcome::Cancelled => Err(QueryError::Cancelled),
        }
    }
}

/// One attempt factory: each call produces a fresh future for the
/// caller-supplied operation.
pub type Attempt = Box<dyn Fn() -> BoxFuture<'static, Result<Value, FetchError>> + Send>;

// == Execute ==
/// Runs `operation` under `policy` until it settles.
///
/// `on_failure` fires after every failed attempt with the running failure
/// streak, so entries can surface "retrying..." state. `on_pause` reports
/// transitions into and out of the paused state while the online signal
/// reads false; pausing consumes no attempt and does not reset the streak.
pub async fn execute(
    operation: Attempt,
    policy: RetryPolicy,
    cancel: CancellationToken,
    mut online: watch::Receiver<bool>,
    mut on_failure: impl FnMut(u32, &FetchError) + Send,
    mut on_pause: impl FnMut(bool) + Send,
) -> FetchOutcome {
    let mut failure_count: u32 = 0;

    loop {
        // Pause gate: wait out offline periods before spending an attempt
        if !*online.borrow_and_update() {
            on_pause(true);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        trace!("retryer cancelled while paused");
                        return FetchOutcome::Cancelled;
                    }
                    changed = online.changed() => {
                        // A dropped sender means no signal source; resume
                        if changed.is_err() || *online.borrow_and_update() {
                            break;
                        }
                    }
                }
            }
            on_pause(false);
        }

        let attempt = operation();
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                trace!("retryer cancelled mid-attempt");
                return FetchOutcome::Cancelled;
            }
            result = attempt => result,
        };

        match result {
            Ok(data) => return FetchOutcome::Success(data),
            Err(error) => {
                failure_count += 1;
                on_failure(failure_count, &error);

                if !policy.allows_retry(failure_count, &error) {
                    debug!(failure_count, %error, "retries exhausted");
                    return FetchOutcome::Failure(error);
                }

                let delay = policy.delay.duration_for(failure_count, &error);
                trace!(failure_count, ?delay, "retrying after backoff");
                tokio::select! {
                    _ = cancel.cancelled() => return FetchOutcome::Cancelled,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
