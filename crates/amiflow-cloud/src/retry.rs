//! Bounded retry with backoff for single idempotent cloud calls

use crate::error::{CloudError, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Delay growth between attempts
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Constant(Duration),
    Linear {
        initial: Duration,
        step: Duration,
        max: Duration,
    },
    Exponential {
        initial: Duration,
        multiplier: f64,
        max: Duration,
    },
}

impl Backoff {
    /// Delay after the given zero-based failed attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Constant(delay) => delay,
            Backoff::Linear { initial, step, max } => {
                initial.saturating_add(step.saturating_mul(attempt)).min(max)
            }
            Backoff::Exponential {
                initial,
                multiplier,
                max,
            } => {
                let secs = initial.as_secs_f64() * multiplier.powi(attempt as i32);
                if !secs.is_finite() || secs >= max.as_secs_f64() {
                    max
                } else {
                    Duration::from_secs_f64(secs)
                }
            }
        }
    }
}

impl From<&RetryConfig> for Backoff {
    fn from(config: &RetryConfig) -> Self {
        Backoff::Exponential {
            initial: config.initial_delay,
            multiplier: config.backoff_multiplier,
            max: config.max_delay,
        }
    }
}

/// Retry configuration for provider operations
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, 0 for unbounded
    pub max_attempts: u32,

    /// Initial delay between retries
    pub initial_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 11,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

type Predicate = Arc<dyn Fn(&CloudError) -> bool + Send + Sync>;

/// Retries an operation while its error matches a predicate
///
/// ```ignore
/// let instance = Retry::new(10)
///     .retry_if(|e| e.is_not_found())
///     .run(cancel, || compute.describe_instance(&id))
///     .await?;
/// ```
#[derive(Clone)]
pub struct Retry {
    tries: u32,
    backoff: Backoff,
    should_retry: Predicate,
}

impl Retry {
    /// `tries` of 0 retries until the operation succeeds or the build is cancelled
    pub fn new(tries: u32) -> Self {
        Self {
            tries,
            backoff: Backoff::from(&RetryConfig::default()),
            should_retry: Arc::new(|e: &CloudError| e.is_throttled()),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts).backoff(Backoff::from(config))
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn retry_if<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&CloudError) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    /// Retry on any of the given provider error codes (and on throttling)
    pub fn retry_on_codes(self, codes: &'static [&'static str]) -> Self {
        self.retry_if(move |e| e.is_code(codes) || e.is_throttled())
    }

    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut failures: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(CloudError::Cancelled);
            }

            let error = match attempt().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            failures += 1;

            if !(self.should_retry)(&error) {
                return Err(error);
            }
            if self.tries != 0 && failures >= self.tries {
                debug!(attempts = failures, error = %error, "Retries exhausted");
                return Err(error);
            }

            let delay = self.backoff.delay_for_attempt(failures - 1);
            debug!(
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying"
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(CloudError::Cancelled),
                _ = sleep(delay) => {}
            }
        }
    }
}
