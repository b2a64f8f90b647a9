use std::collections::BTreeMap;
use std::sync::Arc;
use stowage_core::Pod;

/// Pod being scheduled together with the node selection it asks for
#[derive(Debug, Clone)]
pub struct SchedulingContext {
    /// Pod to be scheduled
    pub pod: Arc<Pod>,
    /// Configured node label selector merged with the pod's node selector
    pub node_selector: BTreeMap<String, String>,
}

impl SchedulingContext {
    /// Create a context, merging `base_selector` with the pod's own node selector.
    ///
    /// Keys present in both take the pod's value.
    pub fn new(pod: Arc<Pod>, base_selector: &BTreeMap<String, String>) -> Self {
        let mut node_selector = base_selector.clone();
        if let Some(selector) = pod.spec.as_ref().and_then(|s| s.node_selector.as_ref()) {
            node_selector.extend(selector.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        Self { pod, node_selector }
    }
}

/// Result of filtering a node
#[derive(Debug, Clone)]
pub struct FilterResult {
    /// Node name
    pub node_name: String,
    /// Whether the node passed the filter
    pub passed: bool,
    /// Reason for failure (if any)
    pub reason: Option<String>,
}

impl FilterResult {
    /// Create a passing filter result
    pub fn pass(node_name: String) -> Self {
        Self {
            node_name,
            passed: true,
            reason: None,
        }
    }

    /// Create a failing filter result
    pub fn fail(node_name: String, reason: String) -> Self {
        Self {
            node_name,
            passed: false,
            reason: Some(reason),
        }
    }
}
