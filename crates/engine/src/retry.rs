//! Bounded retry for flaky network operations.
//!
//! Fetches against the queue service and log storage fail transiently under
//! load. `retry` re-runs an operation up to `max_attempts` times with a fixed
//! sleep in between; a caller-supplied bypass predicate lets errors that can
//! never succeed (e.g. an artifact that will never exist) return at once.
//! `retry_non_empty` additionally treats an empty successful result as a
//! failed attempt.

use std::fmt::{Debug, Display};
use std::future::Future;
use std::time::Duration;

use thiserror::Error;

/// Default number of attempts per operation.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default sleep between attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// How many times to try, and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(interval: Duration) -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_INTERVAL)
    }
}

/// Why a single attempt did not produce a usable value.
#[derive(Debug, Error)]
pub enum AttemptError<E> {
    #[error("\"{operation}\" returned an empty value: {value}")]
    Empty { operation: String, value: String },

    #[error(transparent)]
    Failed(E),
}

/// Outcome of a retried operation that did not succeed.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every attempt failed; `source` is the last failure.
    #[error("\"{operation}\" failed after {attempts} attempts")]
    Exhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: AttemptError<E>,
    },

    /// The operation raised an error the caller asked not to retry.
    #[error(transparent)]
    Bypassed(E),
}

impl<E> RetryError<E> {
    /// The underlying error of the last attempt, if it was an error rather
    /// than an empty value.
    pub fn last_error(&self) -> Option<&E> {
        match self {
            RetryError::Exhausted {
                source: AttemptError::Failed(e),
                ..
            } => Some(e),
            RetryError::Exhausted { .. } => None,
            RetryError::Bypassed(e) => Some(e),
        }
    }
}

/// Values that can be "empty" for `retry_non_empty`.
pub trait Emptiness {
    fn is_empty_value(&self) -> bool;
}

impl Emptiness for String {
    fn is_empty_value(&self) -> bool {
        self.is_empty()
    }
}

impl<T> Emptiness for Vec<T> {
    fn is_empty_value(&self) -> bool {
        self.is_empty()
    }
}

impl Emptiness for serde_json::Value {
    fn is_empty_value(&self) -> bool {
        match self {
            serde_json::Value::Null => true,
            serde_json::Value::Bool(b) => !b,
            serde_json::Value::String(s) => s.is_empty(),
            serde_json::Value::Array(a) => a.is_empty(),
            serde_json::Value::Object(o) => o.is_empty(),
            serde_json::Value::Number(_) => false,
        }
    }
}

impl<T: Emptiness> Emptiness for Option<T> {
    fn is_empty_value(&self) -> bool {
        self.as_ref().is_none_or(Emptiness::is_empty_value)
    }
}

/// Run `op` until it succeeds, `bypass` matches its error, or the policy's
/// attempts are used up.
pub async fn retry<T, E, F, Fut, B>(
    policy: &RetryPolicy,
    operation: &str,
    bypass: B,
    op: F,
) -> Result<T, RetryError<E>>
where
    T: Debug,
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    B: Fn(&E) -> bool,
{
    run(policy, operation, bypass, op, |_| false).await
}

/// Like `retry`, but an empty successful value also counts as a failed
/// attempt.
pub async fn retry_non_empty<T, E, F, Fut, B>(
    policy: &RetryPolicy,
    operation: &str,
    bypass: B,
    op: F,
) -> Result<T, RetryError<E>>
where
    T: Emptiness + Debug,
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    B: Fn(&E) -> bool,
{
    run(policy, operation, bypass, op, |value: &T| value.is_empty_value()).await
}

/// Never bypass; use as the `bypass` argument when every error is transient.
pub fn no_bypass<E>(_: &E) -> bool {
    false
}

async fn run<T, E, F, Fut, B, C>(
    policy: &RetryPolicy,
    operation: &str,
    bypass: B,
    mut op: F,
    is_empty: C,
) -> Result<T, RetryError<E>>
where
    T: Debug,
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    B: Fn(&E) -> bool,
    C: Fn(&T) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        let failure = match op().await {
            Ok(value) if !is_empty(&value) => return Ok(value),
            Ok(value) => AttemptError::Empty {
                operation: operation.to_string(),
                value: format!("{:?}", value),
            },
            Err(e) if bypass(&e) => {
                tracing::debug!(
                    operation,
                    attempt,
                    error = %e,
                    "Bypass error met, not retrying"
                );
                return Err(RetryError::Bypassed(e));
            }
            Err(e) => AttemptError::Failed(e),
        };

        if attempt >= max_attempts {
            tracing::warn!(
                operation,
                attempts = attempt,
                reason = %failure,
                "Too many retries, giving up"
            );
            return Err(RetryError::Exhausted {
                operation: operation.to_string(),
                attempts: attempt,
                source: failure,
            });
        }

        tracing::warn!(
            operation,
            attempt,
            retry_in_secs = policy.interval.as_secs_f64(),
            reason = %failure,
            "Attempt failed, retrying"
        );
        tokio::time::sleep(policy.interval).await;
    }
}
