//! Region, credentials profile and polling settings

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const POLL_DELAY_ENV: &str = "AWS_POLL_DELAY_SECONDS";
pub const MAX_ATTEMPTS_ENV: &str = "AWS_MAX_ATTEMPTS";

const DEFAULT_POLL_DELAY_SECONDS: u64 = 15;
const DEFAULT_MAX_ATTEMPTS: u32 = 40;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessConfig {
    /// Build region; falls back to `AWS_REGION` / `AWS_DEFAULT_REGION`
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub aws_polling: Option<PollingConfig>,
}

/// Overrides for every wait on remote state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollingConfig {
    pub delay_seconds: Option<u64>,
    pub max_attempts: Option<u32>,
}

/// Effective polling after template, environment and defaults are merged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Polling {
    pub delay: Duration,
    pub max_attempts: u32,
}

impl AccessConfig {
    pub(crate) fn prepare(&mut self, errors: &mut Vec<String>) {
        if self.region.is_empty() {
            self.region = std::env::var("AWS_REGION")
                .or_else(|_| std::env::var("AWS_DEFAULT_REGION"))
                .unwrap_or_default();
        }
        if self.region.is_empty() {
            errors.push("region is required (or set AWS_REGION)".to_string());
        }
        if let Some(polling) = &self.aws_polling {
            if polling.delay_seconds == Some(0) {
                errors.push("aws_polling.delay_seconds must be greater than 0".to_string());
            }
            if polling.max_attempts == Some(0) {
                errors.push("aws_polling.max_attempts must be greater than 0".to_string());
            }
        }
    }

    /// Template block first, then `AWS_POLL_DELAY_SECONDS` / `AWS_MAX_ATTEMPTS`
    pub fn polling(&self) -> Polling {
        let block = self.aws_polling.clone().unwrap_or_default();
        let env_u64 = |name: &str| std::env::var(name).ok().and_then(|v| v.parse::<u64>().ok());

        let delay = block
            .delay_seconds
            .or_else(|| env_u64(POLL_DELAY_ENV))
            .filter(|d| *d > 0)
            .unwrap_or(DEFAULT_POLL_DELAY_SECONDS);
        let max_attempts = block
            .max_attempts
            .or_else(|| env_u64(MAX_ATTEMPTS_ENV).and_then(|v| u32::try_from(v).ok()))
            .filter(|a| *a > 0)
            .unwrap_or(DEFAULT_MAX_ATTEMPTS);

        Polling {
            delay: Duration::from_secs(delay),
            max_attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_polling_defaults() {
        temp_env::with_vars_unset([POLL_DELAY_ENV, MAX_ATTEMPTS_ENV], || {
            let polling = AccessConfig::default().polling();
            assert_eq!(polling.delay, Duration::from_secs(15));
            assert_eq!(polling.max_attempts, 40);
        });
    }

    #[test]
    #[serial]
    fn test_polling_env_then_block() {
        temp_env::with_vars(
            [(POLL_DELAY_ENV, Some("5")), (MAX_ATTEMPTS_ENV, Some("100"))],
            || {
                let mut access = AccessConfig::default();
                assert_eq!(access.polling().delay, Duration::from_secs(5));
                assert_eq!(access.polling().max_attempts, 100);

                access.aws_polling = Some(PollingConfig {
                    delay_seconds: Some(2),
                    max_attempts: None,
                });
                assert_eq!(access.polling().delay, Duration::from_secs(2));
                assert_eq!(access.polling().max_attempts, 100);
            },
        );
    }

    #[test]
    #[serial]
    fn test_region_from_env() {
        temp_env::with_vars(
            [("AWS_REGION", Some("eu-west-1")), ("AWS_DEFAULT_REGION", None)],
            || {
                let mut access = AccessConfig::default();
                let mut errors = Vec::new();
                access.prepare(&mut errors);
                assert!(errors.is_empty());
                assert_eq!(access.region, "eu-west-1");
            },
        );
    }
}
