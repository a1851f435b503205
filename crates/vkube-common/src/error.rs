//! Error types for vkube
//!
//! Errors are structured with fields to aid debugging in production. Startup
//! failures carry the component that failed, reconcile failures carry the
//! object they were raised for.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for vkube operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Invalid configuration or object shape
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Resource or component with the invalid configuration
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.clusterIP")
        field: Option<String>,
    },

    /// Optimistic concurrency failure; the write raced another writer
    #[error("conflict on {resource}: {message}")]
    Conflict {
        /// Object the write was issued against
        resource: String,
        /// Description of the conflict
        message: String,
    },

    /// A physical object occupies the translated name but is not ours
    #[error("ownership conflict on {resource}: {message}")]
    Ownership {
        /// Physical object holding the name
        resource: String,
        /// Description of the collision
        message: String,
    },

    /// Startup wiring failed for a syncer or controller
    #[error("{component}: {message}")]
    Registration {
        /// Syncer or controller name
        component: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "queue", "manager", "webhook")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context and field path
    pub fn validation_for_field(
        resource: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a conflict error for the given object
    pub fn conflict(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Conflict {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create an ownership conflict for the given physical object
    pub fn ownership(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Ownership {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a registration error naming the failing component
    pub fn registration(component: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Registration {
            component: component.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
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
    /// Every reconcile failure is retried with backoff except an ownership
    /// collision, which waits for an operator, and startup wiring failures,
    /// which end the process.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::Ownership { .. } | Error::Registration { .. })
    }

    /// Check if this error is an optimistic concurrency conflict
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409,
            _ => false,
        }
    }

    /// Check if this error is an API 404
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::Kube {
                source: kube::Error::Api(ae)
            } if ae.code == 404
        )
    }

    /// Short label used for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Kube { .. } => "kube",
            Error::Validation { .. } => "validation",
            Error::Conflict { .. } => "conflict",
            Error::Ownership { .. } => "ownership",
            Error::Registration { .. } => "registration",
            Error::Serialization { .. } => "serialization",
            Error::Internal { .. } => "internal",
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            Error::Registration { component, .. } => Some(component),
            _ => None,
        }
    }
}

/// Returns true when a kube error is an API response with the given status code
pub fn is_api_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == code)
}
