//! Placement strategies choosing a node for a pod from a [`State`]

use crate::config::{DensityAndExperienceConfig, SchedulerConfig, StrategyName};
use crate::error::{Result, SchedulerError};
use crate::state::{debug_string_nodes, node_allocatable, Node, SortOrder, State};
use chrono::{DateTime, Utc};
use std::time::Duration;
use stowage_core::labels;
use stowage_core::{Object, Pod, ResourceQuantities};
use tracing::{debug, warn};

/// Highest density class a node can be put in
const MAX_DENSITY_CLASS: i64 = 7;

/// Chooses a node for a pod.
///
/// An `Err` means the pod is currently unschedulable, not that something broke.
pub trait Strategy: Send + Sync {
    fn select(&self, state: &State, pod: &Pod) -> Result<String>;

    fn name(&self) -> StrategyName;
}

/// Create the strategy configured by name
pub fn create_strategy(config: &SchedulerConfig) -> Box<dyn Strategy> {
    match config.strategy_name {
        StrategyName::EvenLoad => Box::new(EvenLoad),
        StrategyName::EvenLoadSpots => Box::new(EvenLoadSpots),
        StrategyName::DensityAndExperience => Box::new(DensityAndExperience {
            config: config.density_and_experience_config.clone(),
        }),
    }
}

/// Error for a pod no node has room for, listing the usage of `nodes`
pub(crate) fn no_node_with_enough_resources<'a>(
    pod: &Pod,
    nodes: impl IntoIterator<Item = &'a Node>,
) -> SchedulerError {
    let requests = ResourceQuantities::pod_requests(pod);
    let mut requested = ResourceQuantities::format_quantity(requests.memory_bytes);
    if requests.ephemeral_storage_bytes > 0 {
        requested.push_str(&format!(
            " (eph. storage: {})",
            ResourceQuantities::format_quantity(requests.ephemeral_storage_bytes)
        ));
    }

    SchedulerError::no_suitable_nodes(
        pod.name(),
        format!(
            "No node with enough RAM available!\nRequested by pod: {}\nNodes:\n{}",
            requested,
            debug_string_nodes(nodes)
        ),
    )
}

/// Places every pod on the node with the most available RAM
pub struct EvenLoad;

impl Strategy for EvenLoad {
    fn select(&self, state: &State, pod: &Pod) -> Result<String> {
        let sorted = state.sort_nodes_by_available_ram(SortOrder::Desc);
        let requests = ResourceQuantities::pod_requests(pod);

        match sorted.first() {
            Some(node) if node.fits(&requests) => Ok(node.name().to_string()),
            _ => Err(no_node_with_enough_resources(pod, sorted)),
        }
    }

    fn name(&self) -> StrategyName {
        StrategyName::EvenLoad
    }
}

/// Prefers the nodes with the fewest spots left for pods of the same size
///
/// Spots are counted against the node's allocatable memory, not against what
/// is still available, and resource fit is not checked.
pub struct EvenLoadSpots;

impl Strategy for EvenLoadSpots {
    fn select(&self, state: &State, pod: &Pod) -> Result<String> {
        let requested = ResourceQuantities::pod_requests(pod).memory_bytes;

        let mut candidates: Vec<(&Node, i64)> = state
            .nodes
            .values()
            .filter_map(|node| {
                let free_slots = node.pod_slots.map(|s| s.available);
                let mut spots = if requested > 0 {
                    node_allocatable(&node.node).memory_bytes / requested
                } else {
                    free_slots.unwrap_or(i64::MAX)
                };
                if let Some(free_slots) = free_slots {
                    spots = spots.min(free_slots);
                }
                (spots > 0).then_some((node, spots))
            })
            .collect();

        candidates.sort_by_key(|(_, spots)| *spots);
        candidates
            .first()
            .map(|(node, _)| node.name().to_string())
            .ok_or_else(|| SchedulerError::no_suitable_nodes(pod.name(), "no node available"))
    }

    fn name(&self) -> StrategyName {
        StrategyName::EvenLoadSpots
    }
}

/// Packs regular workspaces densely while keeping startup experience in mind
///
/// Headless workspaces go to the least dense node that already runs regular
/// workspaces. Regular workspaces avoid nodes with too many fresh workspaces
/// and prefer nodes with the workspace image cached, as long as that does not
/// cost density.
pub struct DensityAndExperience {
    pub config: DensityAndExperienceConfig,
}

impl DensityAndExperience {
    pub fn new(config: DensityAndExperienceConfig) -> Self {
        Self { config }
    }

    /// Density class 0..=7 by RAM used by regular workspaces
    fn density_class(node: &Node) -> i64 {
        if node.regular_workspace_count() == 0 || node.ram.total <= 0 {
            return 0;
        }
        let class = node.ram.used_regular * 10 / node.ram.total;
        class.min(MAX_DENSITY_CLASS)
    }

    pub(crate) fn select_at(&self, state: &State, pod: &Pod, now: DateTime<Utc>) -> Result<String> {
        let sorted = state.sort_nodes_by_used_regular_workspace_ram(SortOrder::Desc);
        let requests = ResourceQuantities::pod_requests(pod);

        let candidates: Vec<&Node> = sorted.iter().copied().filter(|n| n.fits(&requests)).collect();
        let Some(default_candidate) = candidates.first().copied() else {
            return Err(no_node_with_enough_resources(pod, sorted));
        };

        if labels::is_headless_workspace(pod) {
            let node = candidates
                .iter()
                .rev()
                .find(|n| n.regular_workspace_count() > 0)
                .copied()
                .unwrap_or(default_candidate);
            return Ok(node.name().to_string());
        }

        let fresh_period = Duration::from_secs(self.config.workspace_fresh_period_seconds);
        let candidates: Vec<&Node> = candidates
            .into_iter()
            .filter(|n| n.fresh_workspace_count(fresh_period, now) < self.config.node_fresh_workspace_limit)
            .collect();
        if candidates.is_empty() {
            warn!(
                pod = %pod.name(),
                node = %default_candidate.name(),
                "All candidate nodes host too many fresh workspaces, using the densest one"
            );
            return Ok(default_candidate.name().to_string());
        }

        // the last candidate is never checked for the image
        let mut candidate = candidates[0];
        for next in &candidates[1..] {
            if candidate.has_image_of(pod) {
                return Ok(candidate.name().to_string());
            }
            if Self::density_class(next) < Self::density_class(candidate) {
                break;
            }
            candidate = next;
        }

        debug!(pod = %pod.name(), node = %candidates[0].name(), "No candidate with cached image");
        Ok(candidates[0].name().to_string())
    }
}

impl Strategy for DensityAndExperience {
    fn select(&self, state: &State, pod: &Pod) -> Result<String> {
        self.select_at(state, pod, Utc::now())
    }

    fn name(&self) -> StrategyName {
        StrategyName::DensityAndExperience
    }
}
