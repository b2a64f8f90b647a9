use crate::config::SchedulerConfig;
use crate::filter::{default_filters, eligible_nodes, FilterPredicate};
use crate::queue::{PriorityQueue, QueuedPodInfo};
use crate::slots::SlotCache;
use crate::state::{compute_state, GhostDecision, State};
use crate::strategy::{create_strategy, Strategy};
use crate::types::SchedulingContext;
use crate::{Result, SchedulerError};
use chrono::Utc;
use k8s_openapi::api::core::v1::{EventSource, ObjectReference, PodCondition};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use std::fmt;
use std::sync::Arc;
use stowage_core::labels::{self, REQUIRED_NODE_SERVICES_ANNOTATION};
use stowage_core::resources::{pod_node_name, pod_phase};
use stowage_core::{
    Binding, ClusterEvent, ClusterView, Event, EventFeed, Object, ObjectMeta, Pod,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Grace period given to evicted ghosts
pub const GHOST_DELETION_GRACE_PERIOD_SECONDS: i64 = 10;

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const NEW_NODE_CHANNEL_CAPACITY: usize = 16;

/// Outcome of one scheduling attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulingResult {
    /// The pod was bound to a node
    Bound,
    /// The pod was bound before, by us or someone else
    AlreadyScheduled,
    /// A ghost is being evicted to make room; the pod waits in the backoff pool
    DeletedGhost(String),
    /// No node can take the pod right now
    UnschedulableNoResources,
    /// The pod is being deleted
    PodGone,
}

impl fmt::Display for SchedulingResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulingResult::Bound => write!(f, "bound"),
            SchedulingResult::AlreadyScheduled => write!(f, "alreadyScheduled"),
            SchedulingResult::DeletedGhost(ghost) => write!(f, "deletedGhost({})", ghost),
            SchedulingResult::UnschedulableNoResources => write!(f, "unschedulableNoResources"),
            SchedulingResult::PodGone => write!(f, "podGone"),
        }
    }
}

/// Workspace pod scheduler
pub struct Scheduler {
    config: SchedulerConfig,
    cluster: Arc<dyn ClusterView>,
    strategy: Box<dyn Strategy>,
    filters: Vec<Box<dyn FilterPredicate>>,
    queue: Arc<PriorityQueue>,
    slots: SlotCache,
    ram_safety_buffer: i64,
    did_shutdown: watch::Sender<bool>,
}

impl Scheduler {
    /// Create a new scheduler. Fails on invalid configuration.
    pub fn new(config: SchedulerConfig, cluster: Arc<dyn ClusterView>) -> Result<Self> {
        config.validate()?;

        let strategy = create_strategy(&config);
        let queue = Arc::new(PriorityQueue::with_priority_order(
            config.initial_backoff(),
            config.maximum_backoff(),
        ));
        let ram_safety_buffer = config.ram_safety_buffer_bytes();
        let (did_shutdown, _) = watch::channel(false);

        info!(
            scheduler = %config.scheduler_name,
            namespace = %config.namespace,
            strategy = %strategy.name(),
            "Created scheduler"
        );

        Ok(Self {
            config,
            cluster,
            strategy,
            filters: default_filters(),
            queue,
            slots: SlotCache::new(),
            ram_safety_buffer,
            did_shutdown,
        })
    }

    pub fn queue(&self) -> &Arc<PriorityQueue> {
        &self.queue
    }

    pub fn slots(&self) -> &SlotCache {
        &self.slots
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run until `token` is cancelled.
    ///
    /// Shutdown stops the event feed first, then closes the new-node channel,
    /// then closes the queue and finally signals [`Scheduler::wait_for_shutdown`].
    pub async fn run(self: Arc<Self>, feed: Arc<dyn EventFeed>, token: CancellationToken) -> Result<()> {
        info!("Starting scheduler");

        let (events_tx, mut events_rx) = mpsc::channel::<ClusterEvent>(EVENT_CHANNEL_CAPACITY);
        let (nodes_tx, mut nodes_rx) = mpsc::channel::<String>(NEW_NODE_CHANNEL_CAPACITY);

        let feed_task = {
            let token = token.clone();
            tokio::spawn(async move { feed.run(events_tx, token).await })
        };

        // ends once the feed drops its sender, closing the new-node channel with it
        let dispatcher = {
            let this = self.clone();
            tokio::spawn(async move {
                while let Some(event) = events_rx.recv().await {
                    this.handle_event(event, &nodes_tx);
                }
                debug!("Event dispatcher stopped");
            })
        };

        let rescan = {
            let this = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(this.config.reschedule_interval());
                loop {
                    tokio::select! {
                        _ = interval.tick() => {}
                        node = nodes_rx.recv() => match node {
                            Some(node) => info!(node = %node, "New node, rescanning pending pods"),
                            None => break,
                        },
                    }
                    match this.enqueue_pending_pods().await {
                        Ok(0) => {}
                        Ok(added) => debug!(added, "Enqueued pending pods"),
                        Err(e) => warn!(error = %e, "Failed to rescan pending pods"),
                    }
                }
                debug!("Rescan stopped");
            })
        };

        let flusher = {
            let queue = self.queue.clone();
            let token = token.clone();
            tokio::spawn(async move { queue.run(token).await })
        };

        let worker = {
            let this = self.clone();
            let token = token.clone();
            tokio::spawn(async move { this.work(token).await })
        };

        token.cancelled().await;
        info!("Shutting down scheduler");

        log_join("event feed", feed_task).await;
        log_join("event dispatcher", dispatcher).await;
        log_join("rescan", rescan).await;
        self.queue.close();
        log_join("scheduling worker", worker).await;
        log_join("backoff flusher", flusher).await;

        self.did_shutdown.send_replace(true);
        info!("Scheduler stopped");
        Ok(())
    }

    /// Resolves once [`Scheduler::run`] has shut down completely
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.did_shutdown.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    async fn work(&self, token: CancellationToken) {
        let mut limiter = self.config.rate_limit_interval().map(|period| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval
        });

        while !token.is_cancelled() {
            if let Some(limiter) = limiter.as_mut() {
                limiter.tick().await;
            }
            if let Err(SchedulerError::QueueClosed) = self.schedule_next().await {
                break;
            }
        }
        debug!("Scheduling worker stopped");
    }

    /// Pop the next pod and try to place it. Fails with `QueueClosed` once the
    /// queue is closed and drained.
    pub async fn schedule_next(&self) -> Result<SchedulingResult> {
        let info = self.queue.pop().await.ok_or(SchedulerError::QueueClosed)?;
        let key = info.key();
        let attempt = info.attempts;
        let workspace_type = labels::workspace_type(&info.pod).to_string();

        let result = self.schedule_pod(info).await;
        match &result {
            Ok(result) => debug!(
                pod = %key,
                attempt,
                workspace_type = %workspace_type,
                result = %result,
                "Scheduling attempt done"
            ),
            Err(e) => error!(
                pod = %key,
                attempt,
                workspace_type = %workspace_type,
                error = %e,
                "Scheduling attempt failed"
            ),
        }
        result
    }

    /// React to a cluster change. Never blocks.
    pub fn handle_event(&self, event: ClusterEvent, new_nodes: &mpsc::Sender<String>) {
        match event {
            ClusterEvent::NodeAdded(node) => {
                self.queue.move_all_to_active("newNodeAdded");
                if new_nodes.try_send(node.name().to_string()).is_err() {
                    debug!(node = %node.name(), "Rescan already pending");
                }
            }
            ClusterEvent::PodAdded(pod) => {
                if self.is_pending_for_us(&pod) {
                    self.queue.add(Arc::new(pod));
                }
            }
            ClusterEvent::PodUpdated(pod) => {
                if pod_node_name(&pod).is_some() {
                    let key = pod.key();
                    self.slots.free_slot(&key);
                    self.queue.delete(&key);
                }

                let reason = pod.status.as_ref().and_then(|s| s.reason.as_deref()).unwrap_or("");
                if pod_phase(&pod) == "Failed" && reason.eq_ignore_ascii_case("OutOfMemory") {
                    error!(
                        pod = %pod.key(),
                        node = %pod_node_name(&pod).unwrap_or(""),
                        "Pod ran out of memory, the node is probably overbooked"
                    );
                }
            }
            ClusterEvent::PodDeleted(pod) => {
                let key = pod.key();
                self.slots.free_slot(&key);
                self.queue.delete(&key);
                self.queue.move_all_to_active("podDeleted");
            }
        }
    }

    fn is_pending_for_us(&self, pod: &Pod) -> bool {
        let scheduler_name = pod
            .spec
            .as_ref()
            .and_then(|s| s.scheduler_name.as_deref())
            .unwrap_or("");

        !matches!(pod_phase(pod), "Succeeded" | "Failed")
            && pod_node_name(pod).is_none()
            && scheduler_name == self.config.scheduler_name
            && pod.namespace() == self.config.namespace
    }

    /// Queue every pending pod of this scheduler. Returns how many were new.
    pub async fn enqueue_pending_pods(&self) -> Result<usize> {
        let pods = self.cluster.list_pods().await?;
        let added = pods
            .into_iter()
            .filter(|p| self.is_pending_for_us(p))
            .filter(|p| self.queue.add(Arc::new(p.clone())))
            .count();
        Ok(added)
    }

    /// Try to place one pod
    pub async fn schedule_pod(&self, info: QueuedPodInfo) -> Result<SchedulingResult> {
        let pod = info.pod.clone();
        let key = pod.key();

        if self.slots.has_already_been_scheduled(&key) {
            debug!(pod = %key, "Pod was scheduled already");
            return Ok(SchedulingResult::AlreadyScheduled);
        }

        let (state, node_name) = match self.select_node(&pod).await {
            Ok(selected) => selected,
            Err(SchedulerError::NoSuitableNodes { reason, .. }) => {
                self.queue.add_unschedulable(info.clone());
                self.record_scheduling_failure(&info, &reason).await?;
                return Ok(SchedulingResult::UnschedulableNoResources);
            }
            Err(e) => {
                self.queue.add_unschedulable(info);
                return Err(e);
            }
        };

        let mut ghost_to_delete = None;
        if labels::is_non_ghost_workspace(&pod) {
            let reserved = self.slots.reserved_ghosts_on_node(&node_name, &key);
            match state.find_spare_ghost_to_delete(&node_name, &pod, &reserved) {
                GhostDecision::NotNeeded => {}
                GhostDecision::Replace(ghost) => ghost_to_delete = Some(ghost),
                GhostDecision::Unschedulable => {
                    warn!(pod = %key, node = %node_name, "No spare ghost left to replace");
                    self.queue.add_unschedulable(info);
                    return Ok(SchedulingResult::UnschedulableNoResources);
                }
            }
        }

        self.slots.reserve_slot(pod.clone(), &node_name, ghost_to_delete.clone());

        if let Some(ghost) = ghost_to_delete {
            if let Err(e) = self.delete_ghost(&ghost).await {
                self.slots.free_slot(&key);
                self.queue.add_unschedulable(info);
                return Err(e);
            }
            info!(pod = %key, node = %node_name, ghost = %ghost, "Evicting ghost to make room");
            self.queue.add_unschedulable(info);
            return Ok(SchedulingResult::DeletedGhost(ghost));
        }

        if let Err(e) = self.bind(&pod, &node_name).await {
            self.slots.free_slot(&key);
            if e.is_already_bound() {
                debug!(pod = %key, "Pod is bound already");
                return Ok(SchedulingResult::AlreadyScheduled);
            }
            if e.is_terminating() {
                debug!(pod = %key, "Pod is being deleted");
                return Ok(SchedulingResult::PodGone);
            }
            error!(pod = %key, node = %node_name, error = %e, "Failed to bind pod");
            return Err(e.into());
        }

        self.emit_event(
            &pod,
            "Normal",
            "Scheduled",
            format!("Placed pod [{}] on {}", key, node_name),
        )
        .await;
        self.slots.mark_as_scheduled(pod, &node_name, None);
        info!(pod = %key, node = %node_name, attempt = info.attempts, "Bound pod");
        Ok(SchedulingResult::Bound)
    }

    async fn select_node(&self, pod: &Arc<Pod>) -> Result<(State, String)> {
        let state = self.build_state(pod).await?;
        if state.nodes.is_empty() {
            return Err(SchedulerError::no_suitable_nodes(
                pod.name(),
                "zero nodes available",
            ));
        }

        let node_name = self.strategy.select(&state, pod)?;
        debug!(pod = %pod.key(), node = %node_name, "Selected node");
        Ok((state, node_name))
    }

    /// State of the nodes eligible for `pod`
    async fn build_state(&self, pod: &Arc<Pod>) -> Result<State> {
        let nodes: Vec<Arc<stowage_core::Node>> = self
            .cluster
            .list_nodes()
            .await?
            .into_iter()
            .map(Arc::new)
            .collect();
        let context = SchedulingContext::new(pod.clone(), &self.config.node_label_selector);
        let nodes = eligible_nodes(&self.filters, &context, nodes);

        let pods: Vec<Arc<Pod>> = self
            .cluster
            .list_pods()
            .await?
            .into_iter()
            .map(Arc::new)
            .collect();

        let mut state = compute_state(
            &nodes,
            &pods,
            &self.slots.bindings(&pod.key()),
            self.ram_safety_buffer,
            !labels::is_non_ghost_workspace(pod),
            &self.config.namespace,
        );

        let required = required_node_services(pod);
        if !required.is_empty() {
            state.filter_nodes(|node| required.iter().all(|s| node.services.contains(*s)));
        }

        Ok(state)
    }

    async fn delete_ghost(&self, ghost: &str) -> Result<()> {
        match self
            .cluster
            .delete_pod(&self.config.namespace, ghost, GHOST_DELETION_GRACE_PERIOD_SECONDS)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!(ghost = %ghost, "Ghost is gone already");
                Ok(())
            }
            Err(e) => {
                error!(ghost = %ghost, error = %e, "Failed to delete ghost");
                Err(e.into())
            }
        }
    }

    async fn bind(&self, pod: &Pod, node_name: &str) -> stowage_core::Result<()> {
        let binding = Binding {
            metadata: ObjectMeta {
                name: pod.metadata.name.clone(),
                namespace: pod.metadata.namespace.clone(),
                uid: pod.metadata.uid.clone(),
                ..Default::default()
            },
            target: ObjectReference {
                api_version: Some("v1".to_string()),
                kind: Some("Node".to_string()),
                name: Some(node_name.to_string()),
                ..Default::default()
            },
        };
        self.cluster.bind(pod.namespace(), &binding).await
    }

    /// Mark the pod `PodScheduled=False`, unless it already is.
    ///
    /// Rewriting the condition on every attempt would keep the cluster
    /// autoscaler busy.
    async fn record_scheduling_failure(&self, info: &QueuedPodInfo, reason: &str) -> Result<()> {
        let key = info.key();

        // the queued copy is stale once the condition was written
        let mut pod = match self
            .cluster
            .get_pod(info.pod.namespace(), info.pod.name())
            .await
        {
            Ok(pod) => pod,
            Err(e) => {
                warn!(pod = %key, error = %e, "Failed to fetch pod, using the queued copy");
                (*info.pod).clone()
            }
        };
        if has_condition(&pod, "PodScheduled", "False") {
            return Ok(());
        }

        warn!(pod = %key, attempt = info.attempts, reason = %reason, "Pod is unschedulable");
        self.emit_event(&pod, "Warning", "FailedScheduling", reason.to_string())
            .await;

        let status = pod.status.get_or_insert_with(Default::default);
        let conditions = status.conditions.get_or_insert_with(Vec::new);
        conditions.retain(|c| c.type_ != "PodScheduled");
        conditions.push(PodCondition {
            type_: "PodScheduled".to_string(),
            status: "False".to_string(),
            reason: Some("Unschedulable".to_string()),
            message: Some(reason.to_string()),
            last_transition_time: Some(Time(Utc::now())),
            ..Default::default()
        });

        self.cluster.update_pod_status(&pod).await.map_err(|e| {
            error!(pod = %key, error = %e, "Failed to record scheduling failure");
            SchedulerError::from(e)
        })?;
        Ok(())
    }

    /// Best effort: failures are logged
    async fn emit_event(&self, pod: &Pod, event_type: &str, reason: &str, message: String) {
        let now = Time(Utc::now());
        let event = Event {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}-", pod.name())),
                namespace: Some(pod.namespace().to_string()),
                ..Default::default()
            },
            involved_object: ObjectReference {
                api_version: Some("v1".to_string()),
                kind: Some("Pod".to_string()),
                name: pod.metadata.name.clone(),
                namespace: pod.metadata.namespace.clone(),
                uid: pod.metadata.uid.clone(),
                resource_version: pod.metadata.resource_version.clone(),
                ..Default::default()
            },
            reason: Some(reason.to_string()),
            message: Some(message),
            type_: Some(event_type.to_string()),
            source: Some(EventSource {
                component: Some(self.config.scheduler_name.clone()),
                ..Default::default()
            }),
            first_timestamp: Some(now.clone()),
            last_timestamp: Some(now),
            count: Some(1),
            ..Default::default()
        };

        if let Err(e) = self.cluster.create_event(pod.namespace(), &event).await {
            warn!(pod = %pod.key(), reason = %reason, error = %e, "Failed to record event");
        }
    }
}

fn has_condition(pod: &Pod, condition_type: &str, status: &str) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == condition_type && c.status == status)
        })
        .unwrap_or(false)
}

/// Node services listed in the pod's required-services annotation
fn required_node_services(pod: &Pod) -> Vec<&str> {
    pod.annotation(REQUIRED_NODE_SERVICES_ANNOTATION)
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

async fn log_join(task: &str, handle: JoinHandle<()>) {
    if let Err(e) = handle.await {
        error!(task, error = %e, "Task ended abnormally");
    }
}
