//! Error types for the Daytona binding controller and webhook
//!
//! Errors carry the binding key (namespace/name) they relate to so that log
//! lines and status conditions can be traced back to a single resource.

use thiserror::Error;

/// Default context value when no specific binding is known
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for binding operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The binding spec is invalid and needs to be corrected by the user
    #[error("validation error for {binding}: {message}")]
    Validation {
        /// Binding key (namespace/name)
        binding: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.authMount")
        field: Option<String>,
    },

    /// The subject could not be resolved (yet)
    #[error("subject {subject} of {binding} could not be resolved: {message}")]
    SubjectResolution {
        /// Binding key (namespace/name)
        binding: String,
        /// Human readable subject reference
        subject: String,
        /// Description of what failed
        message: String,
    },

    /// A status write raced another writer
    #[error("conflict updating status of {binding}")]
    Conflict {
        /// Binding key (namespace/name)
        binding: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// The surrounding operation was cancelled before it completed
    #[error("{operation} cancelled")]
    Cancelled {
        /// Operation that was aborted
        operation: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Context where the error occurred (e.g., "webhook", "tracker")
        context: String,
        /// Description of what failed
        message: String,
    },
}

impl Error {
    /// Create a validation error without binding context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            binding: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a binding and field path
    pub fn validation_for_field(
        binding: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            binding: binding.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a subject resolution error
    pub fn subject_not_found(
        binding: impl Into<String>,
        subject: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::SubjectResolution {
            binding: binding.into(),
            subject: subject.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create a cancellation error for the named operation
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Map a kube error to `Conflict` when the API server answered 409
    pub fn from_status_write(binding: impl Into<String>, err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(resp) if resp.code == 409 => Self::Conflict {
                binding: binding.into(),
            },
            _ => Self::Kube { source: err },
        }
    }

    /// Whether the error is a resource-version conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Whether retrying the same operation can succeed without a spec change
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Kube { .. } | Self::SubjectResolution { .. } | Self::Conflict { .. } => true,
            Self::Internal { .. } => true,
            Self::Validation { .. } | Self::Serialization { .. } | Self::Cancelled { .. } => false,
        }
    }

    /// Machine-readable reason recorded on the binding's conditions
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Kube { .. } => "KubernetesError",
            Self::Validation { .. } => "InvalidSpec",
            Self::SubjectResolution { .. } => "SubjectNotFound",
            Self::Conflict { .. } => "Conflict",
            Self::Serialization { .. } => "SerializationError",
            Self::Cancelled { .. } => "Cancelled",
            Self::Internal { .. } => "InternalError",
        }
    }
}
