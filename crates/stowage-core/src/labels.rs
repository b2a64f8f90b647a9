//! Label contract used to classify pods and nodes

use crate::resources::Object;
use k8s_openapi::api::core::v1::Pod;

/// Label identifying the component a pod belongs to
pub const COMPONENT_LABEL: &str = "component";
/// Value of [`COMPONENT_LABEL`] carried by workspace pods
pub const WORKSPACE_COMPONENT: &str = "workspace";
/// Label marking workspaces that run without an interactive user session
pub const HEADLESS_LABEL: &str = "headless";
/// Label distinguishing workspace kinds (regular, ghost, probe, prebuild, ...)
pub const WORKSPACE_TYPE_LABEL: &str = "workspaceType";
/// Node label set by the node daemon when the workspace disk runs full
pub const DISK_PRESSURE_LABEL: &str = "stowage.dev/diskPressure";
/// Pod label naming the node-level service a pod provides (e.g. a node daemon)
pub const NODE_SERVICE_LABEL: &str = "stowage.dev/nodeService";
/// Pod annotation listing node services (comma separated) a pod requires on its node
pub const REQUIRED_NODE_SERVICES_ANNOTATION: &str = "stowage.dev/requiredNodeServices";

/// Workspace type of regular, user-facing workspaces
pub const WORKSPACE_TYPE_REGULAR: &str = "regular";
/// Workspace type of placeholder pods that keep capacity warm
pub const WORKSPACE_TYPE_GHOST: &str = "ghost";

/// Resource bucket a pod is accounted in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PodClass {
    /// Interactive workspace
    Regular,
    /// Ghost placeholder workspace
    Ghost,
    /// Any other headless workspace (prebuilds, probes)
    Headless,
    /// Not a workspace at all
    Other,
}

/// Workspace pods carry `component=workspace`
pub fn is_workspace(pod: &Pod) -> bool {
    pod.label(COMPONENT_LABEL) == Some(WORKSPACE_COMPONENT)
}

/// Headless workspaces carry `headless=true` in addition to being workspaces
pub fn is_headless_workspace(pod: &Pod) -> bool {
    is_workspace(pod) && pod.label(HEADLESS_LABEL) == Some("true")
}

pub fn is_ghost_workspace(pod: &Pod) -> bool {
    is_workspace(pod) && pod.label(WORKSPACE_TYPE_LABEL) == Some(WORKSPACE_TYPE_GHOST)
}

pub fn is_regular_workspace(pod: &Pod) -> bool {
    is_workspace(pod) && pod.label(WORKSPACE_TYPE_LABEL) == Some(WORKSPACE_TYPE_REGULAR)
}

/// Workspaces of any kind but ghost. These may evict ghosts to make room.
pub fn is_non_ghost_workspace(pod: &Pod) -> bool {
    is_workspace(pod) && !is_ghost_workspace(pod)
}

/// Workspace type label value, empty for non-workspace pods
pub fn workspace_type(pod: &Pod) -> &str {
    if !is_workspace(pod) {
        return "";
    }
    pod.label(WORKSPACE_TYPE_LABEL).unwrap_or("")
}

/// Bucket a pod's resource requests are accounted in
pub fn classify(pod: &Pod) -> PodClass {
    if is_ghost_workspace(pod) {
        PodClass::Ghost
    } else if is_headless_workspace(pod) {
        PodClass::Headless
    } else if is_workspace(pod) {
        PodClass::Regular
    } else {
        PodClass::Other
    }
}
