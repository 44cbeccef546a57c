//! SDK error mapping

use amiflow_cloud::CloudError;
use aws_sdk_ec2::error::{DisplayErrorContext, ProvideErrorMetadata};

/// Convert an SDK error into a [`CloudError::Api`] carrying the service error code
///
/// Both the EC2 and IAM clients share the smithy runtime, so one conversion
/// serves every operation.
pub(crate) fn api_error<E>(operation: &str, err: E) -> CloudError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let code = err.code().unwrap_or("Unknown").to_string();
    let message = match err.message() {
        Some(message) => message.to_string(),
        None => DisplayErrorContext(&err).to_string(),
    };
    tracing::debug!(operation, code = %code, "AWS call failed");
    CloudError::api(operation, code, message)
}

/// Error for a response missing a field the API documents as always present
pub(crate) fn missing_field(operation: &str, field: &str) -> CloudError {
    CloudError::api(
        operation,
        "MissingField",
        format!("response did not include {}", field),
    )
}
