//! Polling until remote state converges

use crate::error::{CloudError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Result of a single poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe<T> {
    Ready(T),
    /// Not there yet; carries the observed state for diagnostics
    Pending(String),
}

/// Polls at a fixed interval until a condition holds or the timeout elapses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Waiter {
    pub interval: Duration,
    pub timeout: Duration,
    /// Treat not-found answers as "not visible yet"
    pub tolerate_not_found: bool,
}

impl Default for Waiter {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            timeout: Duration::from_secs(15 * 40),
            tolerate_not_found: false,
        }
    }
}

impl Waiter {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            tolerate_not_found: false,
        }
    }

    /// `max_attempts` polls `delay` apart
    pub fn from_attempts(delay: Duration, max_attempts: u32) -> Self {
        Self::new(delay, delay.saturating_mul(max_attempts.max(1)))
    }

    pub fn tolerate_not_found(mut self) -> Self {
        self.tolerate_not_found = true;
        self
    }

    pub async fn until<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        what: &str,
        mut probe: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Probe<T>>>,
    {
        let deadline = Instant::now() + self.timeout;
        let mut last_state = String::from("unknown");

        loop {
            if cancel.is_cancelled() {
                return Err(CloudError::Cancelled);
            }

            match probe().await {
                Ok(Probe::Ready(value)) => return Ok(value),
                Ok(Probe::Pending(state)) => {
                    trace!(what, state = %state, "Still waiting");
                    last_state = state;
                }
                Err(e) if self.tolerate_not_found && e.is_not_found() => {
                    last_state = "not-found".to_string();
                }
                Err(e) => return Err(e),
            }

            if Instant::now() >= deadline {
                return Err(CloudError::Timeout {
                    what: what.to_string(),
                    last_state,
                });
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(CloudError::Cancelled),
                _ = sleep(self.interval) => {}
            }
        }
    }

    /// Wait until `describe` reports `target`; any of `failure` ends the wait
    pub async fn until_state<F, Fut>(
        &self,
        cancel: &CancellationToken,
        what: &str,
        target: &str,
        failure: &[&str],
        mut describe: F,
    ) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        self.until(cancel, what, || {
            let observed = describe();
            async move {
                let state = observed.await?;
                if state == target {
                    Ok(Probe::Ready(()))
                } else if failure.contains(&state.as_str()) {
                    Err(CloudError::UnexpectedState {
                        what: what.to_string(),
                        state,
                    })
                } else {
                    Ok(Probe::Pending(state))
                }
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test(start_paused = true)]
    async fn test_until_state_reaches_target() {
        let states = Mutex::new(vec!["available", "pending", "pending"]);
        let waiter = Waiter::new(Duration::from_secs(5), Duration::from_secs(60));

        waiter
            .until_state(&CancellationToken::new(), "image", "available", &["failed"], || async {
                Ok(states.lock().unwrap().pop().unwrap_or("available").to_string())
            })
            .await
            .unwrap();

        assert!(states.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_state_aborts() {
        let waiter = Waiter::new(Duration::from_secs(5), Duration::from_secs(60));

        let err = waiter
            .until_state(&CancellationToken::new(), "image", "available", &["failed"], || async {
                Ok("failed".to_string())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, CloudError::UnexpectedState { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reports_last_state() {
        let waiter = Waiter::from_attempts(Duration::from_secs(2), 3);

        let err = waiter
            .until_state(&CancellationToken::new(), "snapshot", "completed", &[], || async {
                Ok("pending".to_string())
            })
            .await
            .unwrap_err();

        match err {
            CloudError::Timeout { what, last_state } => {
                assert_eq!(what, "snapshot");
                assert_eq!(last_state, "pending");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_tolerated_when_asked() {
        let calls = Mutex::new(0);
        let waiter = Waiter::new(Duration::from_secs(1), Duration::from_secs(10)).tolerate_not_found();

        let value = waiter
            .until(&CancellationToken::new(), "security group", || async {
                let mut calls = calls.lock().unwrap();
                *calls += 1;
                if *calls < 3 {
                    Err(CloudError::api("DescribeSecurityGroups", "InvalidGroup.NotFound", "no"))
                } else {
                    Ok(Probe::Ready("sg-1"))
                }
            })
            .await
            .unwrap();

        assert_eq!(value, "sg-1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_wait() {
        let token = CancellationToken::new();
        let waiter = Waiter::new(Duration::from_secs(3600), Duration::from_secs(7200));
        let started = Instant::now();

        let err = waiter
            .until(&token, "instance", || async {
                token.cancel();
                Ok(Probe::<()>::Pending("pending".to_string()))
            })
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
