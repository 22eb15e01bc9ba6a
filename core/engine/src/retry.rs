//! Bounded retries with exponential backoff.
//!
//! Only errors that report themselves recoverable are retried. Every attempt
//! can carry its own deadline; an attempt that overruns it fails with
//! `Error::Timeout`, which is itself recoverable.

use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use polyweave_common::{Error, Result};

/// Backoff schedule for one provider call.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    /// Upper bound of the exponential growth.
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Scale each delay by a random factor in [0.75, 1.25].
    pub jitter: bool,
}

impl RetryConfig {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
            multiplier: 2.0,
            jitter: true,
        }
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay after the `retry`-th failure, counting from zero.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.min(i32::MAX as u32) as i32;
        let grown = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = grown.min(self.max_backoff.as_secs_f64());

        let scaled = if self.jitter {
            capped * (0.75 + rand::random::<f64>() * 0.5)
        } else {
            capped
        };
        Duration::from_secs_f64(scaled.max(0.0))
    }

    /// Delay before retrying `err`: the backoff, raised to the error's
    /// `retry_after` hint.
    pub fn delay_after(&self, retry: u32, err: &Error) -> Duration {
        let backoff = self.backoff(retry);
        err.retry_after().map_or(backoff, |hint| hint.max(backoff))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Outcome of a retried call.
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T>,
    /// Calls made, first attempt included.
    pub attempts: u32,
}

/// Drives a fallible async call through its [`RetryConfig`].
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
    attempt_timeout: Option<Duration>,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            attempt_timeout: None,
        }
    }

    /// Fail any single attempt that runs longer than `limit`.
    pub fn with_attempt_timeout(mut self, limit: Duration) -> Self {
        self.attempt_timeout = Some(limit);
        self
    }

    /// Call until success, a non-recoverable error, or the retry budget runs
    /// out. The last error is returned together with the attempt count.
    pub async fn run<F, Fut, T>(&self, call: F) -> Attempted<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = 0;

        loop {
            attempts += 1;
            let outcome = match self.attempt_timeout {
                Some(limit) => match timeout(limit, call()).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(Error::Timeout(limit)),
                },
                None => call().await,
            };

            let err = match outcome {
                Ok(value) => {
                    if attempts > 1 {
                        debug!("Call succeeded on attempt {}", attempts);
                    }
                    return Attempted {
                        result: Ok(value),
                        attempts,
                    };
                }
                Err(err) => err,
            };

            let retries_used = attempts - 1;
            if !err.is_recoverable() || retries_used >= self.config.max_retries {
                if err.is_recoverable() {
                    warn!("Giving up after {} attempts: {}", attempts, err);
                }
                return Attempted {
                    result: Err(err),
                    attempts,
                };
            }

            let delay = self.config.delay_after(retries_used, &err);
            debug!("Attempt {} failed: {}; retrying in {:?}", attempts, err, delay);
            sleep(delay).await;
        }
    }

    /// Like [`run`](Self::run), discarding the attempt count.
    pub async fn execute<F, Fut, T>(&self, call: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run(call).await.result
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}
