//! Cloud and pipeline error types

use crate::multierror::MultiError;
use thiserror::Error;

/// Error codes that signal request throttling or rate limiting
const THROTTLE_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
    "RequestThrottled",
    "SnapshotCreationPerVolumeRateExceeded",
    "TooManyRequestsException",
];

/// Cloud and build pipeline errors
#[derive(Error, Debug)]
pub enum CloudError {
    #[error("{operation} failed: {code}: {message}")]
    Api {
        operation: String,
        code: String,
        message: String,
    },

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Resource already exists: {0}")]
    ResourceAlreadyExists(String),

    #[error("Timeout waiting for {what} (last state: {last_state})")]
    Timeout { what: String, last_state: String },

    #[error("Unexpected state while waiting for {what}: {state}")]
    UnexpectedState { what: String, state: String },

    #[error("Build cancelled")]
    Cancelled,

    #[error("Build state is missing '{0}'")]
    MissingState(&'static str),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Command execution failed: {0}")]
    CommandFailed(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("{region}: {source}")]
    InRegion {
        region: String,
        #[source]
        source: Box<CloudError>,
    },

    #[error(transparent)]
    Multi(#[from] MultiError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CloudError {
    pub fn api(
        operation: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        CloudError::Api {
            operation: operation.into(),
            code: code.into(),
            message: message.into(),
        }
    }

    /// Attach the region an error happened in
    pub fn in_region(self, region: impl Into<String>) -> Self {
        CloudError::InRegion {
            region: region.into(),
            source: Box::new(self),
        }
    }

    /// The provider error code, looking through region wrappers
    pub fn code(&self) -> Option<&str> {
        match self {
            CloudError::Api { code, .. } => Some(code.as_str()),
            CloudError::InRegion { source, .. } => source.code(),
            _ => None,
        }
    }

    /// The provider error message, if this is an API error
    pub fn api_message(&self) -> Option<&str> {
        match self {
            CloudError::Api { message, .. } => Some(message.as_str()),
            CloudError::InRegion { source, .. } => source.api_message(),
            _ => None,
        }
    }

    pub fn is_code(&self, codes: &[&str]) -> bool {
        self.code().is_some_and(|code| codes.contains(&code))
    }

    /// `InvalidInstanceID.NotFound`, `NoSuchEntity` and friends
    pub fn is_not_found(&self) -> bool {
        match self {
            CloudError::ResourceNotFound(_) => true,
            CloudError::InRegion { source, .. } => source.is_not_found(),
            _ => self
                .code()
                .is_some_and(|code| code.ends_with("NotFound") || code == "NoSuchEntity"),
        }
    }

    pub fn is_throttled(&self) -> bool {
        self.is_code(THROTTLE_CODES)
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            CloudError::Cancelled => true,
            CloudError::InRegion { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, CloudError>;
