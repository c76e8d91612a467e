//! Retry policy for operations that may fail while a page is settling

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How many times to try and how long to pause between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Pause after a failed attempt, in milliseconds
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 1000,
        }
    }
}

/// What happened across all attempts.
///
/// Nothing is swallowed: a caller that ignores `value == None` has to do so
/// on purpose.
#[derive(Debug, Clone)]
#[must_use = "a retry outcome may carry an abandoned operation"]
pub struct RetryOutcome<T> {
    /// Result of the successful attempt, if any
    pub value: Option<T>,
    /// Attempts made
    pub attempts: u32,
    /// Error message of every failed attempt, oldest first
    pub failures: Vec<String>,
}

impl<T> RetryOutcome<T> {
    /// True if every attempt failed
    pub fn is_abandoned(&self) -> bool {
        self.value.is_none()
    }

    /// Convert into a `Result`, failing with [`Error::RetryExhausted`]
    pub fn into_result(self) -> Result<T> {
        match self.value {
            Some(value) => Ok(value),
            None => Err(Error::RetryExhausted {
                attempts: self.attempts,
                last_error: self.failures.last().cloned().unwrap_or_default(),
            }),
        }
    }
}

impl RetryPolicy {
    /// Create a policy
    pub fn new(max_attempts: u32, backoff_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff_ms,
        }
    }

    /// Run `operation` until it succeeds or attempts run out.
    ///
    /// Each failure is logged as one warning.
    pub async fn run<F, Fut, T>(&self, label: &str, mut operation: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut failures = Vec::new();

        for attempt in 1..=self.max_attempts {
            match operation(attempt).await {
                Ok(value) => {
                    return RetryOutcome {
                        value: Some(value),
                        attempts: attempt,
                        failures,
                    };
                }
                Err(e) => {
                    if attempt < self.max_attempts {
                        tracing::warn!(
                            "{} failed (attempt {}/{}): {}",
                            label,
                            attempt,
                            self.max_attempts,
                            e
                        );
                    } else {
                        tracing::warn!(
                            "{} failed (attempt {}/{}), giving up: {}",
                            label,
                            attempt,
                            self.max_attempts,
                            e
                        );
                    }
                    failures.push(e.to_string());
                    if attempt < self.max_attempts {
                        tokio::time::sleep(Duration::from_millis(self.backoff_ms)).await;
                    }
                }
            }
        }

        RetryOutcome {
            value: None,
            attempts: self.max_attempts,
            failures,
        }
    }
}
