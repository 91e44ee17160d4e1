// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Polling helpers used by the `wait` functions of components.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

/// Result of a single polling attempt.
#[derive(Debug)]
pub enum Outcome<E> {
    /// The condition is met.
    Done,
    /// The condition is not yet met; try again.
    Minor(E),
    /// The condition can never be met; give up immediately.
    Severe(E),
}

/// Errors returned by [`RetryOps::until`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RetryError {
    /// The condition failed in a way retrying cannot fix.
    #[error("{0}")]
    Severe(String),

    /// The condition did not succeed in time.
    #[error("retry failed with {reason}, last error: {last}")]
    Exhausted {
        /// Why retrying stopped, e.g. `context deadline exceeded`.
        reason: &'static str,
        /// Message of the last minor error.
        last: String,
    },
}

/// Polling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryOps {
    /// Time between two attempts.
    pub interval: Duration,
    /// Maximum overall duration.
    pub timeout: Duration,
    /// Optional upper bound on the number of attempts.
    pub max_attempts: Option<usize>,
}

impl RetryOps {
    /// Creates polling parameters with the given interval and timeout.
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            max_attempts: None,
        }
    }

    /// Limits the number of attempts.
    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Polls `f` until it reports [`Outcome::Done`], a severe error, or the
    /// attempts or time budget is exhausted.
    pub async fn until<F, Fut, E>(&self, mut f: F) -> Result<(), RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Outcome<E>>,
        E: Display,
    {
        let deadline = Instant::now() + self.timeout;
        let mut attempts = 0usize;

        loop {
            attempts += 1;
            let last = match f().await {
                Outcome::Done => return Ok(()),
                Outcome::Severe(err) => return Err(RetryError::Severe(err.to_string())),
                Outcome::Minor(err) => err.to_string(),
            };

            if self.max_attempts.is_some_and(|max| attempts >= max) {
                return Err(RetryError::Exhausted {
                    reason: "max attempts reached",
                    last,
                });
            }
            if Instant::now() + self.interval > deadline {
                return Err(RetryError::Exhausted {
                    reason: "context deadline exceeded",
                    last,
                });
            }

            tracing::trace!(attempt = attempts, error = %last, "condition not yet met, retrying");
            tokio::time::sleep(self.interval).await;
        }
    }
}

impl Default for RetryOps {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(120))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_until_succeeds_after_minor_errors() {
        let ops = RetryOps::new(Duration::from_millis(1), Duration::from_secs(1));
        let mut calls = 0;
        let result = ops
            .until(|| {
                calls += 1;
                let done = calls == 3;
                async move {
                    if done {
                        Outcome::Done
                    } else {
                        Outcome::Minor("not yet")
                    }
                }
            })
            .await;
        assert!(result.is_ok());
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_until_stops_on_severe_error() {
        let ops = RetryOps::new(Duration::from_millis(1), Duration::from_secs(1));
        let result = ops.until(|| async { Outcome::Severe("boom") }).await;
        assert_eq!(result, Err(RetryError::Severe("boom".to_string())));
    }

    #[tokio::test]
    async fn test_until_reports_last_error_when_attempts_exhausted() {
        let ops = RetryOps::new(Duration::from_millis(1), Duration::from_secs(1)).with_max_attempts(2);
        let err = ops
            .until(|| async { Outcome::Minor("still pending") })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("still pending"));
        assert!(err.to_string().contains("max attempts reached"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_until_times_out() {
        let ops = RetryOps::new(Duration::from_secs(1), Duration::from_secs(3));
        let err = ops
            .until(|| async { Outcome::Minor("pending") })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("context deadline exceeded"));
    }
}
