//! Local record of placement decisions the cluster has not confirmed yet

use crate::state::Binding;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use stowage_core::{Object, Pod};
use tracing::debug;

/// Capacity promised to a pod on a node
#[derive(Debug, Clone)]
pub struct Slot {
    pub binding: Binding,
    /// Ghost being evicted to make room for the pod
    pub reserved_ghost: Option<String>,
    /// Bound through the API, not merely reserved
    pub scheduled: bool,
}

/// Write-through cache of slots, keyed by pod key.
///
/// Entries are dropped once the cluster reports the pod on a node or deleted,
/// never on a timer.
#[derive(Debug, Default)]
pub struct SlotCache {
    slots: RwLock<HashMap<String, Slot>>,
}

impl SlotCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, pod: Arc<Pod>, node_name: &str, reserved_ghost: Option<String>, scheduled: bool) {
        let key = pod.key();
        debug!(pod = %key, node = %node_name, scheduled, "Recording slot");
        self.slots.write().insert(
            key,
            Slot {
                binding: Binding {
                    pod,
                    node_name: node_name.to_string(),
                },
                reserved_ghost,
                scheduled,
            },
        );
    }

    /// Reserve capacity for a pod that is not bound yet
    pub fn reserve_slot(&self, pod: Arc<Pod>, node_name: &str, reserved_ghost: Option<String>) {
        self.insert(pod, node_name, reserved_ghost, false);
    }

    /// Record a successful bind
    pub fn mark_as_scheduled(&self, pod: Arc<Pod>, node_name: &str, reserved_ghost: Option<String>) {
        self.insert(pod, node_name, reserved_ghost, true);
    }

    pub fn has_already_been_scheduled(&self, pod_key: &str) -> bool {
        self.slots
            .read()
            .get(pod_key)
            .map(|s| s.scheduled)
            .unwrap_or(false)
    }

    pub fn get(&self, pod_key: &str) -> Option<Slot> {
        self.slots.read().get(pod_key).cloned()
    }

    /// Drop the slot of a pod, returning whether there was one
    pub fn free_slot(&self, pod_key: &str) -> bool {
        self.slots.write().remove(pod_key).is_some()
    }

    /// Bindings to overlay on the listed pods when computing state for `pod_key`
    ///
    /// The pod's own reservation is left out unless it is already bound.
    pub fn bindings(&self, pod_key: &str) -> Vec<Binding> {
        self.slots
            .read()
            .iter()
            .filter(|(key, slot)| slot.scheduled || key.as_str() != pod_key)
            .map(|(_, slot)| slot.binding.clone())
            .collect()
    }

    /// Ghosts on `node_name` promised to pods other than `pod_key`
    pub fn reserved_ghosts_on_node(&self, node_name: &str, pod_key: &str) -> HashSet<String> {
        self.slots
            .read()
            .iter()
            .filter(|(key, slot)| key.as_str() != pod_key && slot.binding.node_name == node_name)
            .filter_map(|(_, slot)| slot.reserved_ghost.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_pod(name: &str) -> Arc<Pod> {
        let mut pod = Pod::default();
        pod.metadata.name = Some(name.to_string());
        pod.metadata.namespace = Some("default".to_string());
        Arc::new(pod)
    }

    #[test]
    fn test_reserve_then_schedule() {
        let cache = SlotCache::new();
        let pod = make_pod("ws-1");

        cache.reserve_slot(pod.clone(), "node1", Some("ghost-1".to_string()));
        assert!(!cache.has_already_been_scheduled("default/ws-1"));
        assert_eq!(cache.get("default/ws-1").unwrap().reserved_ghost.as_deref(), Some("ghost-1"));

        cache.mark_as_scheduled(pod, "node1", Some("ghost-1".to_string()));
        assert!(cache.has_already_been_scheduled("default/ws-1"));
        assert_eq!(cache.len(), 1);

        assert!(cache.free_slot("default/ws-1"));
        assert!(!cache.free_slot("default/ws-1"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_own_reservation_is_excluded_from_bindings() {
        let cache = SlotCache::new();
        cache.reserve_slot(make_pod("ws-1"), "node1", None);
        cache.reserve_slot(make_pod("ws-2"), "node2", None);

        let bindings = cache.bindings("default/ws-1");
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].node_name, "node2");

        cache.mark_as_scheduled(make_pod("ws-1"), "node1", None);
        assert_eq!(cache.bindings("default/ws-1").len(), 2);
    }

    #[test]
    fn test_reserved_ghosts_on_node() {
        let cache = SlotCache::new();
        cache.reserve_slot(make_pod("ws-1"), "node1", Some("ghost-1".to_string()));
        cache.reserve_slot(make_pod("ws-2"), "node1", Some("ghost-2".to_string()));
        cache.reserve_slot(make_pod("ws-3"), "node2", Some("ghost-3".to_string()));
        cache.reserve_slot(make_pod("ws-4"), "node1", None);

        let reserved = cache.reserved_ghosts_on_node("node1", "default/ws-1");
        assert_eq!(reserved, HashSet::from(["ghost-2".to_string()]));

        let reserved = cache.reserved_ghosts_on_node("node1", "default/other");
        assert_eq!(reserved.len(), 2);
    }
}
