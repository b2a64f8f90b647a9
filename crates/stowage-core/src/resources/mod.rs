pub mod quantities;

pub use quantities::ResourceQuantities;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Accessors shared by the Kubernetes objects the scheduler works with
pub trait Object {
    /// Get the metadata of this object
    fn metadata(&self) -> &ObjectMeta;

    /// Object name, empty if unset
    fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or("")
    }

    /// Object namespace, empty for cluster-scoped objects
    fn namespace(&self) -> &str {
        self.metadata().namespace.as_deref().unwrap_or("")
    }

    /// Cache key: `namespace/name`, or just `name` for cluster-scoped objects
    fn key(&self) -> String {
        let namespace = self.namespace();
        if namespace.is_empty() {
            self.name().to_string()
        } else {
            format!("{}/{}", namespace, self.name())
        }
    }

    /// Value of a label, if present
    fn label(&self, key: &str) -> Option<&str> {
        self.metadata()
            .labels
            .as_ref()
            .and_then(|labels| labels.get(key))
            .map(String::as_str)
    }

    /// Value of an annotation, if present
    fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata()
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(key))
            .map(String::as_str)
    }

    /// Creation timestamp; objects without one sort as the oldest possible
    fn creation_timestamp(&self) -> DateTime<Utc> {
        self.metadata()
            .creation_timestamp
            .as_ref()
            .map(|t| t.0)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

impl Object for Pod {
    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }
}

impl Object for Node {
    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }
}

/// Node a pod is assigned to, if any
pub fn pod_node_name(pod: &Pod) -> Option<&str> {
    pod.spec
        .as_ref()
        .and_then(|s| s.node_name.as_deref())
        .filter(|n| !n.is_empty())
}

/// Current pod phase, empty if not reported yet
pub fn pod_phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("")
}

/// Whether the pod reports the given condition with status "True"
pub fn pod_condition_is_true(pod: &Pod, condition_type: &str) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == condition_type && c.status == "True")
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodSpec, PodStatus};
    use std::collections::BTreeMap;

    #[test]
    fn test_pod_key() {
        let mut pod = Pod::default();
        pod.metadata.name = Some("ws-1".to_string());
        pod.metadata.namespace = Some("default".to_string());
        assert_eq!(pod.key(), "default/ws-1");

        let mut node = Node::default();
        node.metadata.name = Some("node1".to_string());
        assert_eq!(node.key(), "node1");
    }

    #[test]
    fn test_labels_and_annotations() {
        let mut pod = Pod::default();
        pod.metadata.labels = Some(BTreeMap::from([(
            "component".to_string(),
            "workspace".to_string(),
        )]));
        assert_eq!(pod.label("component"), Some("workspace"));
        assert_eq!(pod.label("headless"), None);
        assert_eq!(pod.annotation("anything"), None);
    }

    #[test]
    fn test_pod_node_name_ignores_empty() {
        let mut pod = Pod {
            spec: Some(PodSpec {
                node_name: Some(String::new()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(pod_node_name(&pod), None);

        pod.spec.as_mut().unwrap().node_name = Some("node1".to_string());
        assert_eq!(pod_node_name(&pod), Some("node1"));
    }

    #[test]
    fn test_pod_condition_is_true() {
        let pod = Pod {
            status: Some(PodStatus {
                conditions: Some(vec![PodCondition {
                    type_: "ContainersReady".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(pod_condition_is_true(&pod, "ContainersReady"));
        assert!(!pod_condition_is_true(&pod, "Ready"));
        assert!(!pod_condition_is_true(&Pod::default(), "ContainersReady"));
    }
}
