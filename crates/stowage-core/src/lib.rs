//! Stowage Core - shared types for the workspace scheduler
//!
//! This crate provides:
//! - Kubernetes type re-exports and object accessors
//! - Resource quantity parsing and formatting
//! - The pod classification label contract
//! - The `ClusterView`/`EventFeed` collaborator traits and an in-memory `MockCluster`
//! - Error types with miette diagnostics

pub mod cluster;
pub mod error;
pub mod labels;
pub mod mock;
pub mod resources;

// Re-export commonly used types
pub use cluster::{ClusterEvent, ClusterView, EventFeed};
pub use error::{Result, StowageError};
pub use labels::PodClass;
pub use mock::{BindFailure, MockCluster};
pub use resources::{Object, ResourceQuantities};

// Re-export k8s-openapi types for convenience
pub use k8s_openapi;
pub use k8s_openapi::api::core::v1::{Binding, Event, Node, Pod};
pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Deserialize an object from JSON
pub fn from_json<T: for<'de> serde::Deserialize<'de>>(data: &str) -> Result<T> {
    serde_json::from_str(data).map_err(|e| {
        StowageError::serialization_error(
            format!("Failed to deserialize from JSON: {}", e),
            Some(Box::new(e)),
        )
    })
}

/// Serialize an object to JSON
pub fn to_json<T: serde::Serialize>(object: &T) -> Result<String> {
    serde_json::to_string(object).map_err(|e| {
        StowageError::serialization_error(
            format!("Failed to serialize to JSON: {}", e),
            Some(Box::new(e)),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_serialization() {
        let mut pod = Pod::default();
        pod.metadata.name = Some("ws-1".to_string());

        let json = to_json(&pod).unwrap();
        assert!(json.contains("ws-1"));

        let deserialized: Pod = from_json(&json).unwrap();
        assert_eq!(deserialized.metadata.name, Some("ws-1".to_string()));

        assert!(from_json::<Pod>("{not json").is_err());
    }
}
