//! Retry policy shared by every external-adapter call.
//!
//! Render and query adapters fail in two ways: transiently (rate limits,
//! timeouts, a busy engine) and permanently (unsupported model, a document
//! that does not compile). Only the first kind is worth repeating. Errors
//! say which kind they are through [`Retriable`]; the policy decides how
//! often and how long to wait.
//!
//! Backoff is exponential: `backoff_ms * 2^(attempt - 1)`, capped at
//! `max_backoff_ms`. With 500 ms base and 3 retries the waits are
//! 500 ms → 1 s → 2 s.

use crate::error::{QueryError, RenderError};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use tokio::time::{sleep, Duration};
use tracing::warn;

/// Errors that know whether repeating the call could help.
pub trait Retriable {
    fn is_retriable(&self) -> bool;
}

impl Retriable for QueryError {
    fn is_retriable(&self) -> bool {
        self.is_transient()
    }
}

impl Retriable for RenderError {
    fn is_retriable(&self) -> bool {
        matches!(self, RenderError::Timeout { .. })
    }
}

/// Max retries and backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Default: 3.
    pub max_retries: u32,
    /// Base backoff. Default: 500 ms.
    pub backoff_ms: u64,
    /// Upper bound on a single wait. Default: 30 s.
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

/// A successful call and how many retries it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retried<T> {
    pub value: T,
    pub retries: u32,
}

/// The last error of a call that never succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryFailure<E> {
    pub error: E,
    pub retries: u32,
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Wait before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.backoff_ms.saturating_mul(factor).min(self.max_backoff_ms))
    }

    /// Run `call` until it succeeds, fails permanently, or retries run out.
    ///
    /// `call` receives the attempt number (0 for the first try).
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut call: F) -> Result<Retried<T>, RetryFailure<E>>
    where
        E: Retriable + Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0u32;
        loop {
            match call(attempt).await {
                Ok(value) => {
                    return Ok(Retried {
                        value,
                        retries: attempt,
                    })
                }
                Err(e) if e.is_retriable() && attempt < self.max_retries => {
                    attempt += 1;
                    let wait = self.delay(attempt);
                    warn!(
                        "{}: {}; retry {}/{} after {}ms",
                        label,
                        e,
                        attempt,
                        self.max_retries,
                        wait.as_millis()
                    );
                    sleep(wait).await;
                }
                Err(e) => {
                    return Err(RetryFailure {
                        error: e,
                        retries: attempt,
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff_ms: 1,
            max_backoff_ms: 5,
        }
    }

    #[test]
    fn delays_double_and_cap() {
        let p = RetryPolicy {
            max_retries: 5,
            backoff_ms: 500,
            max_backoff_ms: 1500,
        };
        assert_eq!(p.delay(1), Duration::from_millis(500));
        assert_eq!(p.delay(2), Duration::from_millis(1000));
        assert_eq!(p.delay(3), Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn two_timeouts_then_success_counts_two_retries() {
        let calls = AtomicU32::new(0);
        let out = fast(3)
            .run("trial", |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(QueryError::Transient("timed out".into()))
                    } else {
                        Ok("answer")
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(out.value, "answer");
        assert_eq!(out.retries, 2);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let err = fast(3)
            .run("trial", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(QueryError::Permanent("unsupported model".into())) }
            })
            .await
            .unwrap_err();
        assert_eq!(err.retries, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn retries_are_bounded() {
        let err = tokio_test::block_on(fast(2).run("trial", |_| async {
            Err::<(), _>(RenderError::Timeout { secs: 1 })
        }))
        .unwrap_err();
        assert_eq!(err.retries, 2);
    }
}
