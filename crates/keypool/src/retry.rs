//! Bounded retry loop over the key pool
//!
//! `generate_with_retry` leases a key, runs the caller-supplied unit of work
//! with it, and on failure cools the key down and fails over to a different
//! one. The attempt budget covers both real failures and "nothing to lease"
//! waits; when it runs out the request fails with `PoolExhausted`. The pool
//! lock is never held while the unit of work runs or while sleeping between
//! attempts.

use std::fmt;
use std::future::Future;

use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::classify::{FailureKind, classify_message};
use crate::error::{Error, Result};
use crate::pool::{KeyPool, LeasedKey};

/// A failed unit-of-work invocation, already mapped to a stable kind.
///
/// Callers construct this at the provider boundary (`classify_status` for
/// HTTP rejections, `from_message` when only error text is available) so the
/// pool never has to understand provider-specific errors.
#[derive(Debug)]
pub struct WorkError {
    pub kind: FailureKind,
    pub message: String,
}

impl WorkError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Build from raw error text, classifying by message patterns.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: classify_message(&message),
            message,
        }
    }
}

impl fmt::Display for WorkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for WorkError {}

impl KeyPool {
    /// Run `work` with a leased key, failing over to other keys on error.
    ///
    /// Each attempt: lease the least-loaded key, invoke `work` with it
    /// (outside the pool lock, optionally capped by `attempt_timeout`), and
    /// return the first success. A failed attempt cools the key down and
    /// sleeps `failure_backoff` before the next one; an attempt that found no
    /// key to lease sleeps the longer `no_credential_backoff` instead. Both
    /// count against `max_attempts`. When the budget is gone the last failure
    /// is surfaced inside `Error::PoolExhausted`.
    pub async fn generate_with_retry<F, Fut, T>(&self, mut work: F) -> Result<T>
    where
        F: FnMut(LeasedKey) -> Fut,
        Fut: Future<Output = std::result::Result<T, WorkError>>,
    {
        let max_attempts = self.config.max_attempts;
        let mut last_error = String::from("no key available");

        for attempt in 1..=max_attempts {
            let Some(lease) = self.acquire().await else {
                warn!(attempt, "every key is cooling down or at its window cap, backing off");
                if attempt < max_attempts {
                    sleep(self.config.no_credential_backoff).await;
                }
                continue;
            };
            let key_id = lease.id.clone();
            let key = lease.key.clone();

            let outcome = match self.config.attempt_timeout {
                Some(limit) => match timeout(limit, work(lease)).await {
                    Ok(result) => result,
                    Err(_) => Err(WorkError::new(
                        FailureKind::Other,
                        format!("attempt timed out after {limit:?}"),
                    )),
                },
                None => work(lease).await,
            };

            match outcome {
                Ok(value) => {
                    debug!(attempt, key = %key_id, "generation succeeded");
                    metrics::counter!("keypool_attempts_total", "result" => "success")
                        .increment(1);
                    return Ok(value);
                }
                Err(err) => {
                    warn!(
                        attempt,
                        key = %key_id,
                        kind = %err.kind,
                        error = %err.message,
                        "generation attempt failed"
                    );
                    metrics::counter!("keypool_attempts_total", "result" => "failure")
                        .increment(1);
                    self.report_failure(key.expose(), err.kind).await;
                    last_error = err.message;
                    if attempt < max_attempts {
                        sleep(self.config.failure_backoff).await;
                    }
                }
            }
        }

        metrics::counter!("keypool_exhaustions_total").increment(1);
        Err(Error::PoolExhausted {
            attempts: max_attempts,
            last_error,
        })
    }

    /// Streaming variant of [`generate_with_retry`].
    ///
    /// Identical selection, failure, and retry semantics applied to *opening*
    /// the stream; `work` returns the open stream handle as its success value.
    /// Failures while consuming the handle are the caller's concern — once
    /// data is flowing the pool's job is done.
    pub async fn generate_stream_with_retry<F, Fut, S>(&self, work: F) -> Result<S>
    where
        F: FnMut(LeasedKey) -> Fut,
        Fut: Future<Output = std::result::Result<S, WorkError>>,
    {
        self.generate_with_retry(work).await
    }
}
