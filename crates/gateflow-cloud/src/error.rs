//! Cloud provider error types

use gateflow_core::FlowError;
use std::time::Duration;
use thiserror::Error;

/// Cloud provider errors
#[derive(Error, Debug)]
pub enum CloudError {
    /// The provider refused the request. Never retried.
    #[error("Provider rejected {resource}: {message}")]
    Rejected { resource: String, message: String },

    /// Rate limiting or eventual-consistency lag. Retried with backoff.
    #[error("Transient provider error on {resource} after {attempts} attempt(s): {message}")]
    Transient {
        resource: String,
        message: String,
        attempts: u32,
    },

    #[error(
        "Timed out after {}s waiting for {resource} to become ready (last status: {last_status})",
        .waited.as_secs()
    )]
    ReadinessTimeout {
        resource: String,
        last_status: String,
        waited: Duration,
    },

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error(
        "Partial apply: {} succeeded, {} failed, {} skipped\n  failed: {}",
        .succeeded.len(),
        .failed.len(),
        .skipped.len(),
        format_failures(.failed)
    )]
    PartialApply {
        succeeded: Vec<String>,
        failed: Vec<(String, String)>,
        skipped: Vec<String>,
    },

    #[error("Output {output} is not available yet: resource {resource} has not been created")]
    OutputUnavailable { output: String, resource: String },

    #[error("Unknown output: {0}")]
    UnknownOutput(String),

    #[error("Cannot resolve {reference} for {resource}")]
    UnresolvedReference { resource: String, reference: String },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Command execution failed: {0}")]
    CommandFailed(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("State file error: {0}")]
    StateError(String),

    #[error("Lock acquisition failed: {0}")]
    LockError(String),

    #[error(transparent)]
    Flow(#[from] FlowError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn format_failures(failed: &[(String, String)]) -> String {
    failed
        .iter()
        .map(|(name, error)| format!("{name} ({error})"))
        .collect::<Vec<_>>()
        .join(", ")
}

impl CloudError {
    pub fn rejected(resource: impl Into<String>, message: impl Into<String>) -> Self {
        CloudError::Rejected {
            resource: resource.into(),
            message: message.into(),
        }
    }

    pub fn transient(resource: impl Into<String>, message: impl Into<String>) -> Self {
        CloudError::Transient {
            resource: resource.into(),
            message: message.into(),
            attempts: 1,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, CloudError::Transient { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, CloudError::Cancelled(_))
    }
}

pub type Result<T> = std::result::Result<T, CloudError>;
