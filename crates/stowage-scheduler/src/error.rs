// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Scheduler error type
#[derive(Error, Debug, Diagnostic)]
pub enum SchedulerError {
    /// No node can take the pod right now
    #[error("{reason}")]
    #[diagnostic(
        code(scheduler::no_suitable_nodes),
        help("The pod stays queued and is retried after backoff. Add nodes or free capacity")
    )]
    NoSuitableNodes {
        #[allow(unused)]
        pod_name: String,
        #[allow(unused)]
        reason: String,
    },

    /// Invalid scheduler configuration
    #[error("Invalid configuration: {message}")]
    #[diagnostic(code(scheduler::invalid_config), help("{suggestion}"))]
    InvalidConfig {
        #[allow(unused)]
        message: String,
        #[allow(unused)]
        suggestion: String,
    },

    /// The queue was closed while waiting for work
    #[error("Scheduling queue is closed")]
    #[diagnostic(
        code(scheduler::queue_closed),
        help("The scheduler is shutting down")
    )]
    QueueClosed,

    /// Cluster access error
    #[error("Cluster error: {0}")]
    #[diagnostic(
        code(scheduler::cluster_error),
        help("Check connectivity to the API server. The pod is retried on the next rescan")
    )]
    ClusterError(#[from] stowage_core::StowageError),

    /// Internal error
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(scheduler::internal_error),
        help("This is likely a bug. Please report it")
    )]
    InternalError {
        #[allow(unused)]
        message: String,
    },
}

/// Result type for scheduler operations
pub type Result<T> = std::result::Result<T, SchedulerError>;

impl SchedulerError {
    /// Create a NoSuitableNodes error
    pub fn no_suitable_nodes(pod_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::NoSuitableNodes {
            pod_name: pod_name.into(),
            reason: reason.into(),
        }
    }

    /// Create an InvalidConfig error
    pub fn invalid_config(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create an InternalError
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }
}
