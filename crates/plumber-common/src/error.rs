//! Error types for the logging pipeline plumber
//!
//! Variants carry enough context (which FlowTest, which endpoint) to be
//! useful in events and logs without re-deriving it at the call site.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for plumber operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A FlowTest or a referenced object is not usable as given
    #[error("validation error for {flow_test}: {message}")]
    Validation {
        /// Name of the FlowTest with invalid input
        flow_test: String,
        /// Description of what's invalid
        message: String,
    },

    /// The log aggregator could not be queried
    #[error("log aggregator error at {endpoint}: {message}")]
    Aggregator {
        /// Endpoint that was queried
        endpoint: String,
        /// Description of what failed
        message: String,
    },

    /// Internal error (should not happen in normal operation)
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Where the error happened
        context: String,
        /// Description of what failed
        message: String,
    },
}

impl Error {
    /// Create a validation error for a specific FlowTest
    pub fn validation_for(flow_test: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            flow_test: flow_test.into(),
            message: msg.into(),
        }
    }

    /// Create an aggregator error
    pub fn aggregator(endpoint: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Aggregator {
            endpoint: endpoint.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            context: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// The API server reported the object does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Kube { source } if crate::kube_utils::is_not_found(source))
    }

    /// The API server reported the object already exists
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::Kube { source } if crate::kube_utils::is_already_exists(source))
    }
}
