//! Concurrent per-region operations with error aggregation

use crate::error::Result;
use crate::multierror::MultiError;
use futures_util::future::join_all;
use std::collections::BTreeMap;
use std::future::Future;

/// Results of a fan-out: every success by key plus every failure
#[derive(Debug)]
pub struct FanOut<T> {
    pub succeeded: BTreeMap<String, T>,
    pub errors: MultiError,
}

impl<T> FanOut<T> {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Run `operation` once per key concurrently and wait for all of them
///
/// A failing key never cancels its siblings. Each error is tagged with the
/// key it came from.
pub async fn fan_out<T, F, Fut>(keys: &[String], operation: F) -> FanOut<T>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let tasks = keys.iter().map(|key| {
        let key = key.clone();
        let fut = operation(key.clone());
        async move { (key, fut.await) }
    });

    let mut outcome = FanOut {
        succeeded: BTreeMap::new(),
        errors: MultiError::new(),
    };

    for (key, result) in join_all(tasks).await {
        match result {
            Ok(value) => {
                outcome.succeeded.insert(key, value);
            }
            Err(error) => {
                tracing::warn!(key = %key, error = %error, "Fan-out task failed");
                outcome.errors.push(error.in_region(key));
            }
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CloudError;
    use std::time::Duration;

    fn regions(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_of_three_failures_are_all_reported() {
        let keys = regions(&["eu-west-1", "us-west-2", "ap-south-1"]);

        let outcome = fan_out(&keys, |region| async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if region == "us-west-2" {
                Ok(format!("ami-{}", region))
            } else {
                Err(CloudError::api("CopyImage", "InvalidRegion", "unsupported"))
            }
        })
        .await;

        assert!(!outcome.is_success());
        assert_eq!(outcome.errors.len(), 2);
        assert_eq!(
            outcome.succeeded.get("us-west-2").map(String::as_str),
            Some("ami-us-west-2")
        );
        let text = outcome.errors.to_string();
        assert!(text.contains("eu-west-1:"));
        assert!(text.contains("ap-south-1:"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tasks_run_concurrently() {
        let keys = regions(&["a", "b", "c"]);
        let started = tokio::time::Instant::now();

        let outcome = fan_out(&keys, |_| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;

        assert!(outcome.is_success());
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }
}
