use amiflow_cloud::{CloudError, MultiError};
use amiflow_config::ConfigError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error("Build halted in step {step}: {source}")]
    Halted {
        step: &'static str,
        #[source]
        source: CloudError,
    },

    #[error("Build cancelled")]
    Cancelled,

    #[error("Failed to destroy artifact: {0}")]
    Destroy(MultiError),
}

impl BuildError {
    /// User-facing message, one line per underlying failure
    pub fn user_message(&self) -> String {
        match self {
            BuildError::Halted {
                step,
                source: CloudError::Multi(errors),
            } => {
                let mut message = format!(
                    "Build halted in step {} with {} errors:",
                    step,
                    errors.len()
                );
                for error in errors.errors() {
                    message.push_str(&format!("\n  * {}", error));
                }
                message
            }
            BuildError::Halted {
                source: CloudError::Timeout { what, last_state },
                ..
            } => {
                format!(
                    "Timed out waiting for {} (last state: {})\n\
                     \n\
                     Raise aws_polling.max_attempts or AWS_MAX_ATTEMPTS if the resource is slow to converge.",
                    what, last_state
                )
            }
            BuildError::Cancelled => {
                "Build cancelled. Temporary resources were cleaned up.".to_string()
            }
            _ => format!("{}", self),
        }
    }
}

pub type Result<T> = std::result::Result<T, BuildError>;
