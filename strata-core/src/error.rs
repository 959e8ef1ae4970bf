//! Error types for strata

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StrataError>;

/// Result type for control-plane calls. Kept separate from [`Result`] so
/// callers can branch on the provider taxonomy without unwrapping layers.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

#[derive(Error, Debug)]
pub enum StrataError {
    #[error("Failed to read manifest at {path:?}: {reason}")]
    Manifest { path: PathBuf, reason: String },

    #[error("Stack not found in app: {stack}")]
    UnknownStack { stack: String },

    #[error("The {stack} stack is in the {status} state. It cannot be {action}.")]
    StackBusy {
        stack: String,
        status: String,
        action: &'static str,
    },

    #[error("Bootstrapping {region} failed: {reason}")]
    BootstrapFailed { region: String, reason: String },

    #[error("Failed to spawn {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Taxonomy of control-plane failures. Provider implementations classify
/// their native errors into these variants at the boundary so the rest of
/// the engine never inspects provider error codes or message text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("Rate exceeded")]
    Throttled,

    #[error("Too many requests")]
    TooManyRequests,

    #[error("Operation aborted")]
    OperationAborted,

    #[error("Request timed out")]
    Timeout,

    #[error("Networking error: {0}")]
    Network(String),

    #[error("Stack {0} does not exist")]
    StackNotFound(String),

    #[error("{code}: {message}")]
    Validation { code: String, message: String },

    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    /// Transient faults that a retry façade may replay indefinitely.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Throttled
                | ProviderError::TooManyRequests
                | ProviderError::OperationAborted
                | ProviderError::Timeout
                | ProviderError::Network(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::StackNotFound(_))
    }

    /// An update that was submitted against an already-current stack.
    pub fn is_no_updates(&self) -> bool {
        matches!(
            self,
            ProviderError::Validation { message, .. }
                if message.contains("No updates are to be performed")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(ProviderError::Throttled.is_retryable());
        assert!(ProviderError::Timeout.is_retryable());
        assert!(ProviderError::Network("connection reset".into()).is_retryable());
        assert!(!ProviderError::StackNotFound("app-dev-db".into()).is_retryable());
        assert!(!ProviderError::Other("boom".into()).is_retryable());
    }

    #[test]
    fn no_updates_detection() {
        let err = ProviderError::Validation {
            code: "ValidationError".into(),
            message: "No updates are to be performed.".into(),
        };
        assert!(err.is_no_updates());
        assert!(!ProviderError::StackNotFound("x".into()).is_no_updates());
    }
}
