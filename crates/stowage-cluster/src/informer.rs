use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use stowage_core::{ClusterEvent, ClusterView, EventFeed, Node, Object, Pod};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default time between two listings
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// What the informer has seen so far
///
/// Pods are compared by `resourceVersion`; an object without one is treated as
/// changed on every listing.
#[derive(Debug, Default)]
pub struct Snapshot {
    nodes: BTreeSet<String>,
    pods: BTreeMap<String, Pod>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the snapshot with a fresh listing, returning what changed.
    ///
    /// Node events come first so pods land on nodes the scheduler knows.
    pub fn apply(&mut self, nodes: Vec<Node>, pods: Vec<Pod>) -> Vec<ClusterEvent> {
        let mut events = Vec::new();

        let listed_nodes: BTreeSet<String> = nodes.iter().map(|n| n.name().to_string()).collect();
        for node in nodes {
            if !self.nodes.contains(node.name()) {
                events.push(ClusterEvent::NodeAdded(node));
            }
        }
        self.nodes = listed_nodes;

        let mut previous = std::mem::take(&mut self.pods);
        for pod in pods {
            let key = pod.key();
            match previous.remove(&key) {
                None => events.push(ClusterEvent::PodAdded(pod.clone())),
                Some(old) => {
                    let unchanged = old.metadata.resource_version.is_some()
                        && old.metadata.resource_version == pod.metadata.resource_version;
                    if !unchanged {
                        events.push(ClusterEvent::PodUpdated(pod.clone()));
                    }
                }
            }
            self.pods.insert(key, pod);
        }
        events.extend(previous.into_values().map(ClusterEvent::PodDeleted));

        events
    }

    pub fn pod_count(&self) -> usize {
        self.pods.len()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

/// Event feed that lists nodes and pods on an interval and reports the differences
pub struct PollingInformer {
    source: Arc<dyn ClusterView>,
    interval: Duration,
}

impl PollingInformer {
    pub fn new(source: Arc<dyn ClusterView>, interval: Duration) -> Self {
        Self { source, interval }
    }

    async fn list(&self) -> stowage_core::Result<(Vec<Node>, Vec<Pod>)> {
        let nodes = self.source.list_nodes().await?;
        let pods = self.source.list_pods().await?;
        Ok((nodes, pods))
    }
}

#[async_trait]
impl EventFeed for PollingInformer {
    async fn run(&self, sender: mpsc::Sender<ClusterEvent>, token: CancellationToken) {
        info!(interval_ms = self.interval.as_millis() as u64, "Starting polling informer");

        let mut snapshot = Snapshot::new();
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {}
            }

            let (nodes, pods) = match self.list().await {
                Ok(listing) => listing,
                Err(e) => {
                    warn!(error = %e, "Listing failed, retrying on the next tick");
                    continue;
                }
            };

            let events = snapshot.apply(nodes, pods);
            if !events.is_empty() {
                debug!(
                    count = events.len(),
                    nodes = snapshot.node_count(),
                    pods = snapshot.pod_count(),
                    "Delivering cluster changes"
                );
            }
            for event in events {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("Polling informer stopped");
                        return;
                    }
                    sent = sender.send(event) => {
                        if sent.is_err() {
                            info!("Event receiver dropped, stopping polling informer");
                            return;
                        }
                    }
                }
            }
        }

        info!("Polling informer stopped");
    }
}
