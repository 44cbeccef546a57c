//! Aggregation of independent failures

use crate::error::CloudError;
use std::fmt;

/// Zero or more errors from concurrent sub-operations
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<CloudError>,
}

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: CloudError) {
        self.errors.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn errors(&self) -> &[CloudError] {
        &self.errors
    }

    /// `Ok(())` when nothing failed, otherwise the whole aggregate
    pub fn into_result(self) -> crate::Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(CloudError::Multi(self))
        }
    }
}

impl Extend<CloudError> for MultiError {
    fn extend<I: IntoIterator<Item = CloudError>>(&mut self, iter: I) {
        self.errors.extend(iter);
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.len() {
            1 => writeln!(f, "1 error occurred:")?,
            n => writeln!(f, "{} errors occurred:", n)?,
        }
        for error in &self.errors {
            writeln!(f, "\t* {}", error)?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_is_ok() {
        assert!(MultiError::new().into_result().is_ok());
    }

    #[test]
    fn test_display_lists_every_error() {
        let mut errors = MultiError::new();
        errors.push(CloudError::ResourceNotFound("ami-1".into()).in_region("eu-west-1"));
        errors.push(CloudError::Cancelled.in_region("ap-south-1"));

        let text = errors.to_string();
        assert!(text.starts_with("2 errors occurred:"));
        assert!(text.contains("eu-west-1: Resource not found: ami-1"));
        assert!(text.contains("ap-south-1: Build cancelled"));
    }
}
