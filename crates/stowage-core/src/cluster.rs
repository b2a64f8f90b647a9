use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Binding, Event, Node, Pod};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A change observed in the cluster
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    NodeAdded(Node),
    PodAdded(Pod),
    PodUpdated(Pod),
    PodDeleted(Pod),
}

impl ClusterEvent {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ClusterEvent::NodeAdded(_) => "NodeAdded",
            ClusterEvent::PodAdded(_) => "PodAdded",
            ClusterEvent::PodUpdated(_) => "PodUpdated",
            ClusterEvent::PodDeleted(_) => "PodDeleted",
        }
    }
}

/// Read and write access to the cluster the scheduler places pods in
///
/// Listing calls may return slightly stale data. Implementations are the
/// Kubernetes API client in production and `MockCluster` in tests.
#[async_trait]
pub trait ClusterView: Send + Sync {
    /// List all nodes
    async fn list_nodes(&self) -> Result<Vec<Node>>;

    /// List pods across all namespaces
    async fn list_pods(&self) -> Result<Vec<Pod>>;

    /// Fetch the current version of a single pod
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod>;

    /// Assign a pod to a node
    async fn bind(&self, namespace: &str, binding: &Binding) -> Result<()>;

    /// Delete a pod with the given grace period, using foreground propagation
    async fn delete_pod(&self, namespace: &str, name: &str, grace_period_seconds: i64)
        -> Result<()>;

    /// Replace the status of a pod, returning the stored version
    async fn update_pod_status(&self, pod: &Pod) -> Result<Pod>;

    /// Record a Kubernetes event
    async fn create_event(&self, namespace: &str, event: &Event) -> Result<()>;
}

/// Source of [`ClusterEvent`]s
#[async_trait]
pub trait EventFeed: Send + Sync {
    /// Deliver events into `sender` until `token` is cancelled or the receiver is dropped
    async fn run(&self, sender: mpsc::Sender<ClusterEvent>, token: CancellationToken);
}
