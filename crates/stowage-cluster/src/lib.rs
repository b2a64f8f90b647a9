//! Stowage Cluster - Kubernetes API adapters
//!
//! - [`ApiClient`] implements `ClusterView` over the Kubernetes REST API
//! - [`PollingInformer`] implements `EventFeed` by listing and diffing

pub mod api_client;
pub mod informer;

pub use api_client::ApiClient;
pub use informer::{PollingInformer, Snapshot, DEFAULT_POLL_INTERVAL};
