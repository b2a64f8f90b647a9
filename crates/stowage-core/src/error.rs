// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Error type for cluster access and shared primitives
#[derive(Error, Debug, Diagnostic)]
pub enum StowageError {
    /// Pod not found
    #[error("Pod not found: {namespace}/{name}")]
    #[diagnostic(
        code(stowage::pod_not_found),
        help("The pod may have been deleted concurrently. It is dropped from local caches on the next informer update")
    )]
    PodNotFound {
        #[allow(unused)]
        namespace: String,
        #[allow(unused)]
        name: String,
    },

    /// Pod is already bound to a node
    #[error("Pod {name} is already assigned to node {node_name}")]
    #[diagnostic(
        code(stowage::pod_already_bound),
        help("Another scheduler instance or an earlier attempt bound this pod. This is not a failure")
    )]
    PodAlreadyBound {
        #[allow(unused)]
        name: String,
        #[allow(unused)]
        node_name: String,
    },

    /// Pod is being deleted
    #[error("Pod {name} is being deleted")]
    #[diagnostic(
        code(stowage::pod_terminating),
        help("The pod was deleted before it could be scheduled. This is not a failure")
    )]
    PodTerminating {
        #[allow(unused)]
        name: String,
    },

    /// Kubernetes API request failed
    #[error("API request failed ({status}): {message}")]
    #[diagnostic(
        code(stowage::api_error),
        help("Check connectivity to the API server and the scheduler's RBAC permissions")
    )]
    ApiError {
        #[allow(unused)]
        status: u16,
        #[allow(unused)]
        message: String,
    },

    /// Serialization error
    #[error("Serialization error: {message}")]
    #[diagnostic(
        code(stowage::serialization_error),
        help("Ensure the API server speaks the Kubernetes v1 JSON format")
    )]
    SerializationError {
        #[allow(unused)]
        message: String,
        #[source]
        #[allow(unused)]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Invalid resource quantity
    #[error("Invalid quantity '{value}': {reason}")]
    #[diagnostic(
        code(stowage::invalid_quantity),
        help("Use Kubernetes quantity notation, e.g. 512Mi, 2Gi, 1500M or 1024")
    )]
    InvalidQuantity {
        #[allow(unused)]
        value: String,
        #[allow(unused)]
        reason: String,
    },

    /// Internal error
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(stowage::internal_error),
        help("This is likely a bug. Please report it with the full error details")
    )]
    InternalError {
        #[allow(unused)]
        message: String,
    },
}

/// Result type alias for cluster operations
pub type Result<T> = std::result::Result<T, StowageError>;

impl StowageError {
    /// Create a PodNotFound error
    pub fn pod_not_found(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::PodNotFound {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Create a PodAlreadyBound error
    pub fn pod_already_bound(name: impl Into<String>, node_name: impl Into<String>) -> Self {
        Self::PodAlreadyBound {
            name: name.into(),
            node_name: node_name.into(),
        }
    }

    /// Create a PodTerminating error
    pub fn pod_terminating(name: impl Into<String>) -> Self {
        Self::PodTerminating { name: name.into() }
    }

    /// Create an ApiError
    pub fn api_error(status: u16, message: impl Into<String>) -> Self {
        Self::ApiError {
            status,
            message: message.into(),
        }
    }

    /// Create a SerializationError
    pub fn serialization_error(
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::SerializationError {
            message: message.into(),
            source,
        }
    }

    /// Create an InvalidQuantity error
    pub fn invalid_quantity(value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidQuantity {
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Create an InternalError
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }

    /// The object did not exist (anymore)
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::PodNotFound { .. } | Self::ApiError { status: 404, .. })
    }

    /// A concurrent actor bound the pod first
    pub fn is_already_bound(&self) -> bool {
        matches!(self, Self::PodAlreadyBound { .. })
    }

    /// The pod is on its way out
    pub fn is_terminating(&self) -> bool {
        matches!(self, Self::PodTerminating { .. })
    }
}
