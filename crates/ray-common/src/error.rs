//! Error types for the Ray operator
//!
//! Each variant maps to one failure category of a reconcile pass, and
//! `is_retryable` decides whether the controller requeues.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Ray operator operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The validator rejected the Ray spec
    #[error("validation error for {ray}: {message}")]
    Validation {
        /// Name of the rejected Ray cluster
        ray: String,
        /// Description of what's invalid
        message: String,
    },

    /// A desired object could not be built from the spec
    #[error("composition error for {ray}: {message}")]
    Composition {
        /// Name of the Ray cluster being composed
        ray: String,
        /// Description of what's missing
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "apply", "status")
        context: String,
    },
}

impl Error {
    /// Create a validation error for a named Ray cluster
    pub fn validation_for(ray: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            ray: ray.into(),
            message: msg.into(),
        }
    }

    /// Create a composition error for a named Ray cluster
    pub fn composition_for(ray: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Composition {
            ray: ray.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation, composition and serialization errors need a spec change.
    /// API failures from apply and status reads are retried by requeue.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { .. } => true,
            Error::Validation { .. } => false,
            Error::Composition { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Get the Ray cluster name if this error is tied to one
    pub fn ray(&self) -> Option<&str> {
        match self {
            Error::Validation { ray, .. } | Error::Composition { ray, .. } => Some(ray),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}
