//! AWS provider error types

use gateflow_cloud::CloudError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AwsError {
    #[error("aws CLI not found. Please install: https://aws.amazon.com/cli/")]
    CliNotFound,

    #[error("aws authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The CLI exited with an error. `code` is the AWS error code when one
    /// could be extracted from stderr.
    #[error("aws {operation} failed: {message}")]
    CommandFailed {
        operation: String,
        code: Option<String>,
        message: String,
    },

    #[error("Gateway activation failed: {0}")]
    Activation(String),

    #[error("Missing attribute '{0}'")]
    MissingAttribute(String),

    #[error("Unexpected response from {operation}: missing {field}")]
    UnexpectedResponse { operation: String, field: String },

    #[error("Invalid resource id: {0}")]
    InvalidId(String),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, AwsError>;

/// How the executor should treat a failed call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Throttling or eventual-consistency lag
    Transient,
    /// The resource does not exist
    NotFound,
    /// Everything else
    Rejected,
}

const TRANSIENT_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
    "TooManyRequestsException",
    "RequestThrottled",
    "ServiceUnavailable",
    "InternalError",
    "InternalFailure",
    "RequestTimeout",
    // 依存先の削除や伝播がまだ終わっていない
    "DependencyViolation",
    "IncorrectState",
    "IncorrectInstanceState",
    "ConcurrentModification",
    "InvalidGatewayRequestException",
];

const NOT_FOUND_CODES: &[&str] = &[
    "InvalidGroup.NotFound",
    "InvalidInstanceID.NotFound",
    "InvalidVolume.NotFound",
    "InvalidVpcEndpointId.NotFound",
    "NoSuchEntity",
    "NoSuchBucket",
    "NotFound",
    "ResourceNotFoundException",
];

/// Classify an AWS error code
pub fn classify(code: &str) -> ErrorClass {
    if NOT_FOUND_CODES.contains(&code) {
        ErrorClass::NotFound
    } else if TRANSIENT_CODES.contains(&code) {
        ErrorClass::Transient
    } else {
        ErrorClass::Rejected
    }
}

impl AwsError {
    pub fn code(&self) -> Option<&str> {
        match self {
            AwsError::CommandFailed { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            AwsError::CommandFailed { code: Some(code), .. } => classify(code),
            AwsError::HttpError(_) | AwsError::IoError(_) => ErrorClass::Transient,
            _ => ErrorClass::Rejected,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.class() == ErrorClass::NotFound
    }

    /// Convert into the engine's error taxonomy for `resource`
    pub fn into_cloud(self, resource: &str) -> CloudError {
        match self {
            AwsError::CliNotFound | AwsError::AuthenticationFailed(_) => {
                CloudError::AuthenticationFailed(self.to_string())
            }
            _ => match self.class() {
                ErrorClass::Transient => CloudError::transient(resource, self.to_string()),
                _ => CloudError::rejected(resource, self.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(code: &str) -> AwsError {
        AwsError::CommandFailed {
            operation: "ec2 run-instances".to_string(),
            code: Some(code.to_string()),
            message: "boom".to_string(),
        }
    }

    #[test]
    fn test_classification() {
        assert_eq!(classify("RequestLimitExceeded"), ErrorClass::Transient);
        assert_eq!(classify("DependencyViolation"), ErrorClass::Transient);
        assert_eq!(classify("NoSuchEntity"), ErrorClass::NotFound);
        assert_eq!(classify("InvalidParameterValue"), ErrorClass::Rejected);
    }

    #[test]
    fn test_into_cloud() {
        assert!(failed("Throttling").into_cloud("gateway").is_transient());
        assert!(matches!(
            failed("EntityAlreadyExists").into_cloud("bucket_role"),
            CloudError::Rejected { resource, .. } if resource == "bucket_role"
        ));
        assert!(matches!(
            AwsError::CliNotFound.into_cloud("gateway"),
            CloudError::AuthenticationFailed(_)
        ));
    }
}
