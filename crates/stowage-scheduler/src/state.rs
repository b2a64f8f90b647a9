//! Point-in-time view of node capacity and pod placement
//!
//! A [`State`] is computed fresh for every scheduling attempt from the listed
//! nodes and pods plus the local slot cache, and is read-only afterwards.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Node as KubeNode;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use stowage_core::labels::{self, PodClass, NODE_SERVICE_LABEL};
use stowage_core::resources::quantities::RESOURCE_PODS;
use stowage_core::resources::{pod_condition_is_true, pod_node_name, pod_phase};
use stowage_core::{Object, Pod, ResourceQuantities};

/// Name of the container whose image decides image locality
pub const WORKSPACE_CONTAINER_NAME: &str = "workspace";

/// A scheduling decision not yet visible in listed pods
#[derive(Debug, Clone)]
pub struct Binding {
    pub pod: Arc<Pod>,
    pub node_name: String,
}

/// Decomposition of one resource on a node, in bytes
///
/// After [`ResourceUsage::update_available`]:
/// `available + used_headless + used_regular + used_ghost + used_other == total`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceUsage {
    pub total: i64,
    pub available: i64,
    pub used_headless: i64,
    pub used_regular: i64,
    pub used_ghost: i64,
    pub used_other: i64,
}

impl ResourceUsage {
    fn new(total: i64) -> Self {
        Self {
            total,
            available: total,
            ..Default::default()
        }
    }

    fn add(&mut self, class: PodClass, amount: i64) {
        let used = match class {
            PodClass::Regular => &mut self.used_regular,
            PodClass::Ghost => &mut self.used_ghost,
            PodClass::Headless => &mut self.used_headless,
            PodClass::Other => &mut self.used_other,
        };
        *used = used.saturating_add(amount);
    }

    pub fn update_available(&mut self) {
        self.available = self
            .total
            .saturating_sub(self.used_headless)
            .saturating_sub(self.used_regular)
            .saturating_sub(self.used_ghost)
            .saturating_sub(self.used_other);
    }

    fn debug_string(&self) -> String {
        let mb = ResourceQuantities::mega_ceil;
        format!(
            "used {}(r)+{}(g)+{}(h)+{}(o) of {}, avail {} Mi",
            mb(self.used_regular),
            mb(self.used_ghost),
            mb(self.used_headless),
            mb(self.used_other),
            mb(self.total),
            mb(self.available)
        )
    }
}

/// Kubernetes' per-node pod capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PodSlots {
    pub total: i64,
    pub available: i64,
}

/// A node together with the pods assigned to it and their resource usage
#[derive(Debug, Clone)]
pub struct Node {
    pub node: Arc<KubeNode>,
    /// Pods accounted on this node
    pub pods: Vec<Arc<Pod>>,
    /// Ghosts of the scheduler namespace that were not accounted
    pub ghosts: Vec<Arc<Pod>>,
    pub ram: ResourceUsage,
    pub ephemeral_storage: ResourceUsage,
    /// `None` if the node does not report a pod capacity
    pub pod_slots: Option<PodSlots>,
    /// Node services provided by ready pods on this node
    pub services: BTreeSet<String>,
}

impl Node {
    pub fn name(&self) -> &str {
        self.node.name()
    }

    /// Number of non-headless workspaces on the node
    pub fn regular_workspace_count(&self) -> usize {
        self.pods
            .iter()
            .filter(|p| labels::classify(p) == PodClass::Regular)
            .count()
    }

    /// Number of workspaces on the node created less than `fresh_period` before `now`
    pub fn fresh_workspace_count(&self, fresh_period: Duration, now: DateTime<Utc>) -> usize {
        self.pods
            .iter()
            .filter(|p| labels::is_workspace(p))
            .filter(|p| {
                let age = now.signed_duration_since(p.creation_timestamp());
                age.to_std().map(|age| age < fresh_period).unwrap_or(true)
            })
            .count()
    }

    /// Whether the node has the image of the pod's workspace container cached
    pub fn has_image_of(&self, pod: &Pod) -> bool {
        let image = pod
            .spec
            .as_ref()
            .and_then(|s| s.containers.iter().find(|c| c.name == WORKSPACE_CONTAINER_NAME))
            .and_then(|c| c.image.as_deref());
        let Some(image) = image.filter(|i| !i.is_empty()) else {
            return false;
        };

        self.node
            .status
            .as_ref()
            .and_then(|s| s.images.as_ref())
            .map(|images| {
                images
                    .iter()
                    .any(|i| i.names.iter().flatten().any(|name| name == image))
            })
            .unwrap_or(false)
    }

    /// Whether a pod with these requests fits into what is available
    pub fn fits(&self, requests: &ResourceQuantities) -> bool {
        requests.memory_bytes <= self.ram.available
            && (requests.ephemeral_storage_bytes == 0
                || requests.ephemeral_storage_bytes <= self.ephemeral_storage.available)
            && self.pod_slots.map(|s| s.available > 0).unwrap_or(true)
    }

    pub fn debug_string(&self) -> String {
        format!(
            "- {}:\n  RAM: {}\n  Eph. Storage: {}",
            self.name(),
            self.ram.debug_string(),
            self.ephemeral_storage.debug_string()
        )
    }
}

/// Human readable resource usage of the given nodes, one block per node
pub fn debug_string_nodes<'a>(nodes: impl IntoIterator<Item = &'a Node>) -> String {
    nodes
        .into_iter()
        .map(Node::debug_string)
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Outcome of looking for a ghost to evict on a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GhostDecision {
    /// The pod fits without evicting anything
    NotNeeded,
    /// Evicting this ghost makes room for the pod
    Replace(String),
    /// Not even evicting every remaining ghost makes room
    Unschedulable,
}

/// Cluster snapshot a placement strategy works on
#[derive(Debug, Clone, Default)]
pub struct State {
    pub nodes: BTreeMap<String, Node>,
    /// All known pods by `namespace/name`
    pub pods: BTreeMap<String, Arc<Pod>>,
    pub bindings: Vec<Binding>,
}

/// Aggregate nodes, pods and local bindings into a [`State`]
///
/// Bindings override the node a listed pod reports. When `ghosts_visible` is
/// false, ghosts in `namespace` are not accounted but kept as eviction
/// candidates in [`Node::ghosts`].
pub fn compute_state(
    nodes: &[Arc<KubeNode>],
    pods: &[Arc<Pod>],
    bindings: &[Binding],
    ram_safety_buffer: i64,
    ghosts_visible: bool,
    namespace: &str,
) -> State {
    let mut all_pods: BTreeMap<String, Arc<Pod>> = BTreeMap::new();
    let mut assignments: HashMap<String, (Arc<Pod>, String)> = HashMap::new();
    for pod in pods {
        let key = pod.key();
        if let Some(node_name) = pod_node_name(pod) {
            assignments.insert(key.clone(), (pod.clone(), node_name.to_string()));
        }
        all_pods.insert(key, pod.clone());
    }
    for binding in bindings {
        let key = binding.pod.key();
        assignments.insert(key.clone(), (binding.pod.clone(), binding.node_name.clone()));
        all_pods.entry(key).or_insert_with(|| binding.pod.clone());
    }

    let mut pods_per_node: HashMap<String, Vec<Arc<Pod>>> = HashMap::new();
    for (pod, node_name) in assignments.into_values() {
        pods_per_node.entry(node_name).or_default().push(pod);
    }

    let mut state_nodes = BTreeMap::new();
    for kube_node in nodes {
        let allocatable = node_allocatable(kube_node);
        let pod_capacity = kube_node
            .status
            .as_ref()
            .and_then(|s| s.capacity.as_ref())
            .and_then(|c| c.get(RESOURCE_PODS))
            .and_then(|q| ResourceQuantities::parse_quantity(&q.0).ok());

        let mut node = Node {
            node: kube_node.clone(),
            pods: Vec::new(),
            ghosts: Vec::new(),
            ram: ResourceUsage::new(allocatable.memory_bytes - ram_safety_buffer),
            ephemeral_storage: ResourceUsage::new(allocatable.ephemeral_storage_bytes),
            pod_slots: pod_capacity.map(|total| PodSlots {
                total,
                available: total,
            }),
            services: BTreeSet::new(),
        };

        let mut assigned = pods_per_node.remove(kube_node.name()).unwrap_or_default();
        assigned.sort_by_key(|p| p.key());
        for pod in assigned {
            if matches!(pod_phase(&pod), "Succeeded" | "Failed") {
                continue;
            }

            if let Some(service) = pod.label(NODE_SERVICE_LABEL) {
                if pod_condition_is_true(&pod, "ContainersReady") {
                    node.services.insert(service.to_string());
                }
            }

            let class = labels::classify(&pod);
            if class == PodClass::Ghost && !ghosts_visible && pod.namespace() == namespace {
                node.ghosts.push(pod);
                continue;
            }

            let requests = ResourceQuantities::pod_requests(&pod);
            node.ram.add(class, requests.memory_bytes);
            node.ephemeral_storage.add(class, requests.ephemeral_storage_bytes);
            if let Some(slots) = node.pod_slots.as_mut() {
                slots.available -= 1;
            }
            node.pods.push(pod);
        }

        node.ram.update_available();
        node.ephemeral_storage.update_available();
        state_nodes.insert(node.name().to_string(), node);
    }

    State {
        nodes: state_nodes,
        pods: all_pods,
        bindings: bindings.to_vec(),
    }
}

impl State {
    /// Remove every node the predicate rejects
    pub fn filter_nodes(&mut self, predicate: impl Fn(&Node) -> bool) {
        self.nodes.retain(|_, node| predicate(node));
    }

    fn sorted_nodes_by(&self, key: impl Fn(&Node) -> i64, order: SortOrder) -> Vec<&Node> {
        let mut nodes: Vec<&Node> = self.nodes.values().collect();
        nodes.sort_by(|a, b| {
            let by_value = match order {
                SortOrder::Asc => key(a).cmp(&key(b)),
                SortOrder::Desc => key(b).cmp(&key(a)),
            };
            by_value.then_with(|| a.name().cmp(b.name()))
        });
        nodes
    }

    /// Nodes ordered by available RAM; equal nodes by name
    pub fn sort_nodes_by_available_ram(&self, order: SortOrder) -> Vec<&Node> {
        self.sorted_nodes_by(|n| n.ram.available, order)
    }

    /// Nodes ordered by RAM used by regular workspaces; equal nodes by name
    pub fn sort_nodes_by_used_regular_workspace_ram(&self, order: SortOrder) -> Vec<&Node> {
        self.sorted_nodes_by(|n| n.ram.used_regular, order)
    }

    /// Decide whether `pod` needs a ghost on `node_name` evicted.
    ///
    /// Ghosts in `reserved_ghosts` are already promised to other pods and are
    /// treated as gone.
    pub fn find_spare_ghost_to_delete(
        &self,
        node_name: &str,
        pod: &Pod,
        reserved_ghosts: &HashSet<String>,
    ) -> GhostDecision {
        let Some(node) = self.nodes.get(node_name) else {
            return GhostDecision::Unschedulable;
        };

        let mut spare: Vec<&Arc<Pod>> = node
            .ghosts
            .iter()
            .filter(|g| !reserved_ghosts.contains(g.name()))
            .collect();

        let mut ram = node.ram.available;
        let mut ephemeral_storage = node.ephemeral_storage.available;
        for ghost in &spare {
            let requests = ResourceQuantities::pod_requests(ghost);
            ram -= requests.memory_bytes;
            ephemeral_storage -= requests.ephemeral_storage_bytes;
        }
        let slots = node
            .pod_slots
            .map(|s| s.available - spare.len() as i64);

        let requests = ResourceQuantities::pod_requests(pod);
        let fits = requests.memory_bytes <= ram
            && (requests.ephemeral_storage_bytes == 0
                || requests.ephemeral_storage_bytes <= ephemeral_storage)
            && slots.map(|s| s > 0).unwrap_or(true);
        if fits {
            return GhostDecision::NotNeeded;
        }

        spare.sort_by(|a, b| match a.creation_timestamp().cmp(&b.creation_timestamp()) {
            Ordering::Equal => a.name().cmp(b.name()),
            other => other,
        });
        match spare.first() {
            Some(ghost) => GhostDecision::Replace(ghost.name().to_string()),
            None => GhostDecision::Unschedulable,
        }
    }
}

/// Memory and ephemeral storage of a node as reported by the API server
pub fn node_allocatable(node: &KubeNode) -> ResourceQuantities {
    node.status
        .as_ref()
        .and_then(|s| s.allocatable.as_ref())
        .map(ResourceQuantities::from_k8s_resource_map)
        .unwrap_or_default()
}
