use crate::cluster::{ClusterEvent, ClusterView, EventFeed};
use crate::error::{Result, StowageError};
use crate::resources::{pod_node_name, Object};
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{Binding, Event, Node, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Failure to return from the next `bind` call for a pod
#[derive(Debug, Clone)]
pub enum BindFailure {
    /// Another actor bound the pod to this node first
    AlreadyBound(String),
    /// The pod is being deleted
    Terminating,
    /// Generic API failure
    Api(u16, String),
}

#[derive(Default)]
struct MockState {
    nodes: BTreeMap<String, Node>,
    pods: BTreeMap<String, Pod>,
    next_resource_version: u64,
    bindings: Vec<(String, String)>,
    deleted: Vec<String>,
    defer_deletes: bool,
    pending_deletes: Vec<String>,
    bind_failures: HashMap<String, BindFailure>,
    events: Vec<Event>,
    status_updates: Vec<Pod>,
}

impl MockState {
    fn stamp(&mut self, meta: &mut ObjectMeta) {
        self.next_resource_version += 1;
        meta.resource_version = Some(self.next_resource_version.to_string());
    }
}

/// In-memory cluster for tests
///
/// Stores nodes and pods, records every write the scheduler performs and
/// publishes a [`ClusterEvent`] for each mutation. Deletions can be deferred
/// so a test decides when an eviction becomes visible.
pub struct MockCluster {
    state: Mutex<MockState>,
    events_tx: broadcast::Sender<ClusterEvent>,
}

impl Default for MockCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCluster {
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(1024);
        Self {
            state: Mutex::new(MockState::default()),
            events_tx,
        }
    }

    /// Receive every event published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events_tx.subscribe()
    }

    fn publish(&self, event: ClusterEvent) {
        // no subscribers is fine
        let _ = self.events_tx.send(event);
    }

    pub fn add_node(&self, mut node: Node) {
        {
            let mut state = self.state.lock();
            state.stamp(&mut node.metadata);
            state.nodes.insert(node.name().to_string(), node.clone());
        }
        self.publish(ClusterEvent::NodeAdded(node));
    }

    pub fn add_pod(&self, mut pod: Pod) {
        {
            let mut state = self.state.lock();
            state.stamp(&mut pod.metadata);
            state.pods.insert(pod.key(), pod.clone());
        }
        self.publish(ClusterEvent::PodAdded(pod));
    }

    /// Replace a stored pod, publishing an update
    pub fn update_pod(&self, mut pod: Pod) {
        {
            let mut state = self.state.lock();
            state.stamp(&mut pod.metadata);
            state.pods.insert(pod.key(), pod.clone());
        }
        self.publish(ClusterEvent::PodUpdated(pod));
    }

    /// Remove a pod immediately, publishing a deletion
    pub fn remove_pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        let removed = self
            .state
            .lock()
            .pods
            .remove(&format!("{}/{}", namespace, name));
        if let Some(pod) = &removed {
            self.publish(ClusterEvent::PodDeleted(pod.clone()));
        }
        removed
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.state
            .lock()
            .pods
            .get(&format!("{}/{}", namespace, name))
            .cloned()
    }

    /// Hold back pod deletions until [`MockCluster::apply_pending_deletes`] is called
    pub fn set_defer_deletes(&self, defer: bool) {
        self.state.lock().defer_deletes = defer;
    }

    /// Keys of pods whose deletion was requested but not yet applied
    pub fn pending_deletes(&self) -> Vec<String> {
        self.state.lock().pending_deletes.clone()
    }

    /// Apply all deferred deletions, returning how many pods were removed
    pub fn apply_pending_deletes(&self) -> usize {
        let removed: Vec<Pod> = {
            let mut state = self.state.lock();
            let keys = std::mem::take(&mut state.pending_deletes);
            keys.iter().filter_map(|k| state.pods.remove(k)).collect()
        };
        let count = removed.len();
        for pod in removed {
            self.publish(ClusterEvent::PodDeleted(pod));
        }
        count
    }

    /// Apply the deferred deletion of a single pod, if one was requested
    pub fn apply_pending_delete(&self, namespace: &str, name: &str) -> bool {
        let key = format!("{}/{}", namespace, name);
        let removed = {
            let mut state = self.state.lock();
            let Some(pos) = state.pending_deletes.iter().position(|k| *k == key) else {
                return false;
            };
            state.pending_deletes.remove(pos);
            state.pods.remove(&key)
        };
        match removed {
            Some(pod) => {
                self.publish(ClusterEvent::PodDeleted(pod));
                true
            }
            None => false,
        }
    }

    /// Make the next `bind` of `namespace/name` fail
    pub fn fail_next_bind(&self, namespace: &str, name: &str, failure: BindFailure) {
        self.state
            .lock()
            .bind_failures
            .insert(format!("{}/{}", namespace, name), failure);
    }

    /// Successful bindings as `(pod key, node name)`, in call order
    pub fn bindings(&self) -> Vec<(String, String)> {
        self.state.lock().bindings.clone()
    }

    /// Keys of pods deleted through `delete_pod`, in call order
    pub fn deleted_pods(&self) -> Vec<String> {
        self.state.lock().deleted.clone()
    }

    pub fn recorded_events(&self) -> Vec<Event> {
        self.state.lock().events.clone()
    }

    pub fn status_updates(&self) -> Vec<Pod> {
        self.state.lock().status_updates.clone()
    }
}

#[async_trait]
impl ClusterView for MockCluster {
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.state.lock().nodes.values().cloned().collect())
    }

    async fn list_pods(&self) -> Result<Vec<Pod>> {
        Ok(self.state.lock().pods.values().cloned().collect())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        self.pod(namespace, name)
            .ok_or_else(|| StowageError::pod_not_found(namespace, name))
    }

    async fn bind(&self, namespace: &str, binding: &Binding) -> Result<()> {
        let name = binding.metadata.name.as_deref().unwrap_or("");
        let key = format!("{}/{}", namespace, name);
        let node_name = binding.target.name.clone().unwrap_or_default();

        let bound = {
            let mut state = self.state.lock();
            if let Some(failure) = state.bind_failures.remove(&key) {
                return Err(match failure {
                    BindFailure::AlreadyBound(node) => StowageError::pod_already_bound(name, node),
                    BindFailure::Terminating => StowageError::pod_terminating(name),
                    BindFailure::Api(status, message) => StowageError::api_error(status, message),
                });
            }

            let mut pod = state
                .pods
                .get(&key)
                .cloned()
                .ok_or_else(|| StowageError::pod_not_found(namespace, name))?;
            if let Some(existing) = pod_node_name(&pod) {
                return Err(StowageError::pod_already_bound(name, existing));
            }
            if pod.metadata.deletion_timestamp.is_some() {
                return Err(StowageError::pod_terminating(name));
            }

            pod.spec.get_or_insert_with(Default::default).node_name = Some(node_name.clone());
            state.stamp(&mut pod.metadata);
            state.pods.insert(key.clone(), pod.clone());
            state.bindings.push((key, node_name));
            pod
        };

        debug!("Mock: pod {} bound", bound.key());
        self.publish(ClusterEvent::PodUpdated(bound));
        Ok(())
    }

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        _grace_period_seconds: i64,
    ) -> Result<()> {
        let key = format!("{}/{}", namespace, name);
        let removed = {
            let mut state = self.state.lock();
            if !state.pods.contains_key(&key) || state.pending_deletes.contains(&key) {
                return Err(StowageError::pod_not_found(namespace, name));
            }
            state.deleted.push(key.clone());

            if state.defer_deletes {
                if let Some(pod) = state.pods.get_mut(&key) {
                    pod.metadata.deletion_timestamp = Some(Time(Utc::now()));
                }
                state.pending_deletes.push(key.clone());
                None
            } else {
                state.pods.remove(&key)
            }
        };

        debug!("Mock: pod {} deleted", key);
        if let Some(pod) = removed {
            self.publish(ClusterEvent::PodDeleted(pod));
        }
        Ok(())
    }

    async fn update_pod_status(&self, pod: &Pod) -> Result<Pod> {
        let key = pod.key();
        let updated = {
            let mut state = self.state.lock();
            let mut stored = state
                .pods
                .get(&key)
                .cloned()
                .ok_or_else(|| StowageError::pod_not_found(pod.namespace(), pod.name()))?;
            stored.status = pod.status.clone();
            state.stamp(&mut stored.metadata);
            state.pods.insert(key, stored.clone());
            state.status_updates.push(stored.clone());
            stored
        };

        self.publish(ClusterEvent::PodUpdated(updated.clone()));
        Ok(updated)
    }

    async fn create_event(&self, _namespace: &str, event: &Event) -> Result<()> {
        self.state.lock().events.push(event.clone());
        Ok(())
    }
}

#[async_trait]
impl EventFeed for MockCluster {
    async fn run(&self, sender: mpsc::Sender<ClusterEvent>, token: CancellationToken) {
        let mut rx = self.subscribe();

        // replay what exists, the way an informer's initial list does
        let (nodes, pods) = {
            let state = self.state.lock();
            (
                state.nodes.values().cloned().collect::<Vec<_>>(),
                state.pods.values().cloned().collect::<Vec<_>>(),
            )
        };
        let initial = nodes
            .into_iter()
            .map(ClusterEvent::NodeAdded)
            .chain(pods.into_iter().map(ClusterEvent::PodAdded));
        for event in initial {
            if sender.send(event).await.is_err() {
                return;
            }
        }

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                received = rx.recv() => match received {
                    Ok(event) => {
                        if sender.send(event).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("Mock: feed lagged by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ObjectReference;

    fn make_test_pod(name: &str) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.name = Some(name.to_string());
        pod.metadata.namespace = Some("default".to_string());
        pod.spec = Some(Default::default());
        pod
    }

    fn make_binding(name: &str, node: &str) -> Binding {
        let mut binding = Binding::default();
        binding.metadata.name = Some(name.to_string());
        binding.target = ObjectReference {
            kind: Some("Node".to_string()),
            name: Some(node.to_string()),
            ..Default::default()
        };
        binding
    }

    #[tokio::test]
    async fn test_bind_assigns_node_and_detects_races() {
        let cluster = MockCluster::new();
        cluster.add_pod(make_test_pod("ws-1"));

        cluster.bind("default", &make_binding("ws-1", "node1")).await.unwrap();
        let pod = cluster.get_pod("default", "ws-1").await.unwrap();
        assert_eq!(pod_node_name(&pod), Some("node1"));
        assert_eq!(
            cluster.bindings(),
            vec![("default/ws-1".to_string(), "node1".to_string())]
        );

        let err = cluster
            .bind("default", &make_binding("ws-1", "node2"))
            .await
            .unwrap_err();
        assert!(err.is_already_bound());

        let err = cluster
            .bind("default", &make_binding("missing", "node1"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_injected_bind_failure_is_used_once() {
        let cluster = MockCluster::new();
        cluster.add_pod(make_test_pod("ws-1"));
        cluster.fail_next_bind("default", "ws-1", BindFailure::Terminating);

        let err = cluster
            .bind("default", &make_binding("ws-1", "node1"))
            .await
            .unwrap_err();
        assert!(err.is_terminating());
        assert!(cluster.bind("default", &make_binding("ws-1", "node1")).await.is_ok());
    }

    #[tokio::test]
    async fn test_deferred_deletes() {
        let cluster = MockCluster::new();
        cluster.add_pod(make_test_pod("ghost-1"));
        cluster.set_defer_deletes(true);

        cluster.delete_pod("default", "ghost-1", 10).await.unwrap();
        assert_eq!(cluster.pending_deletes(), vec!["default/ghost-1".to_string()]);
        // still listed, but marked for deletion
        let pods = cluster.list_pods().await.unwrap();
        assert_eq!(pods.len(), 1);
        assert!(pods[0].metadata.deletion_timestamp.is_some());

        // a second delete of the same pod reports it gone
        assert!(cluster
            .delete_pod("default", "ghost-1", 10)
            .await
            .unwrap_err()
            .is_not_found());

        assert_eq!(cluster.apply_pending_deletes(), 1);
        assert!(cluster.list_pods().await.unwrap().is_empty());
        assert_eq!(cluster.deleted_pods(), vec!["default/ghost-1".to_string()]);
    }

    #[tokio::test]
    async fn test_apply_single_pending_delete() {
        let cluster = MockCluster::new();
        cluster.add_pod(make_test_pod("ghost-1"));
        cluster.add_pod(make_test_pod("ghost-2"));
        cluster.set_defer_deletes(true);
        cluster.delete_pod("default", "ghost-1", 10).await.unwrap();
        cluster.delete_pod("default", "ghost-2", 10).await.unwrap();

        assert!(cluster.apply_pending_delete("default", "ghost-2"));
        assert!(!cluster.apply_pending_delete("default", "ghost-2"));
        assert_eq!(cluster.pending_deletes(), vec!["default/ghost-1".to_string()]);
        assert!(cluster.pod("default", "ghost-1").is_some());
        assert!(cluster.pod("default", "ghost-2").is_none());
    }

    #[tokio::test]
    async fn test_feed_replays_existing_objects_then_streams() {
        let cluster = std::sync::Arc::new(MockCluster::new());
        let mut node = Node::default();
        node.metadata.name = Some("node1".to_string());
        cluster.add_node(node);

        let (tx, mut rx) = mpsc::channel(16);
        let token = CancellationToken::new();
        let feed = cluster.clone();
        let feed_token = token.clone();
        let handle = tokio::spawn(async move { feed.run(tx, feed_token).await });

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, ClusterEvent::NodeAdded(_)));

        // wait until the feed is subscribed before mutating
        while cluster.events_tx.receiver_count() == 0 {
            tokio::task::yield_now().await;
        }
        cluster.add_pod(make_test_pod("ws-1"));
        let next = rx.recv().await.unwrap();
        assert_eq!(next.kind(), "PodAdded");

        token.cancel();
        handle.await.unwrap();
    }
}
