use crate::types::{FilterResult, SchedulingContext};
use k8s_openapi::api::core::v1::{NodeSelectorRequirement, NodeSelectorTerm, Taint, Toleration};
use std::sync::Arc;
use stowage_core::labels::DISK_PRESSURE_LABEL;
use stowage_core::{Node, Object};
use tracing::debug;

/// Filter predicate trait
pub trait FilterPredicate: Send + Sync {
    /// Filter a node for the given pod
    fn filter(&self, context: &SchedulingContext, node: &Node) -> FilterResult;

    /// Name of the filter
    fn name(&self) -> &str;
}

/// Node must carry every label of the merged node selector
pub struct NodeSelectorMatch;

impl FilterPredicate for NodeSelectorMatch {
    fn filter(&self, context: &SchedulingContext, node: &Node) -> FilterResult {
        let node_name = node.name().to_string();

        for (key, value) in &context.node_selector {
            if node.label(key) != Some(value.as_str()) {
                return FilterResult::fail(
                    node_name,
                    format!("Node selector mismatch: {}={}", key, value),
                );
            }
        }

        FilterResult::pass(node_name)
    }

    fn name(&self) -> &str {
        "NodeSelectorMatch"
    }
}

/// Cordoned nodes take no new pods
pub struct NotCordoned;

impl FilterPredicate for NotCordoned {
    fn filter(&self, _context: &SchedulingContext, node: &Node) -> FilterResult {
        let node_name = node.name().to_string();
        let cordoned = node
            .spec
            .as_ref()
            .and_then(|s| s.unschedulable)
            .unwrap_or(false);

        if cordoned {
            FilterResult::fail(node_name, "Node is cordoned".to_string())
        } else {
            FilterResult::pass(node_name)
        }
    }

    fn name(&self) -> &str {
        "NotCordoned"
    }
}

/// Nodes whose workspace disk runs full are skipped
pub struct NoDiskPressure;

impl FilterPredicate for NoDiskPressure {
    fn filter(&self, _context: &SchedulingContext, node: &Node) -> FilterResult {
        let node_name = node.name().to_string();

        if node.label(DISK_PRESSURE_LABEL).is_some() {
            FilterResult::fail(node_name, "Node is under disk pressure".to_string())
        } else {
            FilterResult::pass(node_name)
        }
    }

    fn name(&self) -> &str {
        "NoDiskPressure"
    }
}

/// Required node affinity of the pod.
///
/// Terms are ORed, requirements within a term are ANDed. A term without any
/// requirement matches no node.
pub struct NodeAffinityMatch;

impl NodeAffinityMatch {
    fn term_matches(term: &NodeSelectorTerm, node: &Node) -> bool {
        let expressions = term.match_expressions.as_deref().unwrap_or_default();
        let fields = term.match_fields.as_deref().unwrap_or_default();
        if expressions.is_empty() && fields.is_empty() {
            return false;
        }

        expressions
            .iter()
            .all(|r| Self::requirement_matches(r, node.label(&r.key)))
            && fields.iter().all(|r| {
                let value = (r.key == "metadata.name").then(|| node.name());
                Self::requirement_matches(r, value)
            })
    }

    fn requirement_matches(requirement: &NodeSelectorRequirement, value: Option<&str>) -> bool {
        let values = requirement.values.as_deref().unwrap_or_default();
        let compare = |want: std::cmp::Ordering| {
            let node_value = value.and_then(|v| v.parse::<i64>().ok());
            let wanted = match values {
                [single] => single.parse::<i64>().ok(),
                _ => None,
            };
            match (node_value, wanted) {
                (Some(n), Some(w)) => n.cmp(&w) == want,
                _ => false,
            }
        };

        match requirement.operator.as_str() {
            "In" => value.map(|v| values.iter().any(|x| x == v)).unwrap_or(false),
            "NotIn" => value.map(|v| !values.iter().any(|x| x == v)).unwrap_or(true),
            "Exists" => value.is_some(),
            "DoesNotExist" => value.is_none(),
            "Gt" => compare(std::cmp::Ordering::Greater),
            "Lt" => compare(std::cmp::Ordering::Less),
            _ => false,
        }
    }
}

impl FilterPredicate for NodeAffinityMatch {
    fn filter(&self, context: &SchedulingContext, node: &Node) -> FilterResult {
        let node_name = node.name().to_string();

        let required = context
            .pod
            .spec
            .as_ref()
            .and_then(|s| s.affinity.as_ref())
            .and_then(|a| a.node_affinity.as_ref())
            .and_then(|a| a.required_during_scheduling_ignored_during_execution.as_ref());
        let Some(required) = required else {
            return FilterResult::pass(node_name);
        };

        if required
            .node_selector_terms
            .iter()
            .any(|term| Self::term_matches(term, node))
        {
            FilterResult::pass(node_name)
        } else {
            FilterResult::fail(
                node_name,
                "Node does not match the pod's node affinity".to_string(),
            )
        }
    }

    fn name(&self) -> &str {
        "NodeAffinityMatch"
    }
}

/// Filter for taints and tolerations
///
/// Only `NoSchedule` and `NoExecute` taints keep pods away.
pub struct TaintToleration;

impl TaintToleration {
    fn tolerates(toleration: &Toleration, taint: &Taint) -> bool {
        if let Some(effect) = toleration.effect.as_deref().filter(|e| !e.is_empty()) {
            if effect != taint.effect {
                return false;
            }
        }

        let key = toleration.key.as_deref().unwrap_or("");
        match toleration.operator.as_deref().unwrap_or("Equal") {
            "Exists" => key.is_empty() || key == taint.key,
            _ => {
                key == taint.key
                    && toleration.value.as_deref().unwrap_or("")
                        == taint.value.as_deref().unwrap_or("")
            }
        }
    }
}

impl FilterPredicate for TaintToleration {
    fn filter(&self, context: &SchedulingContext, node: &Node) -> FilterResult {
        let node_name = node.name().to_string();

        let taints = match node.spec.as_ref().and_then(|s| s.taints.as_ref()) {
            Some(t) => t,
            None => return FilterResult::pass(node_name),
        };

        let tolerations = context
            .pod
            .spec
            .as_ref()
            .and_then(|s| s.tolerations.as_deref())
            .unwrap_or_default();

        for taint in taints
            .iter()
            .filter(|t| t.effect == "NoSchedule" || t.effect == "NoExecute")
        {
            if !tolerations.iter().any(|t| Self::tolerates(t, taint)) {
                return FilterResult::fail(
                    node_name,
                    format!("Pod does not tolerate taint: {}={}", taint.key, taint.effect),
                );
            }
        }

        FilterResult::pass(node_name)
    }

    fn name(&self) -> &str {
        "TaintToleration"
    }
}

/// Get default filter predicates
pub fn default_filters() -> Vec<Box<dyn FilterPredicate>> {
    vec![
        Box::new(NodeSelectorMatch),
        Box::new(NotCordoned),
        Box::new(NoDiskPressure),
        Box::new(NodeAffinityMatch),
        Box::new(TaintToleration),
    ]
}

/// Nodes that pass every filter
pub fn eligible_nodes(
    filters: &[Box<dyn FilterPredicate>],
    context: &SchedulingContext,
    nodes: Vec<Arc<Node>>,
) -> Vec<Arc<Node>> {
    nodes
        .into_iter()
        .filter(|node| {
            filters.iter().all(|filter| {
                let result = filter.filter(context, node);
                if !result.passed {
                    debug!(
                        pod = %context.pod.name(),
                        node = %result.node_name,
                        filter = filter.name(),
                        reason = result.reason.as_deref().unwrap_or(""),
                        "Node filtered out"
                    );
                }
                result.passed
            })
        })
        .collect()
}
