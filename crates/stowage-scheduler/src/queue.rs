use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use stowage_core::labels::{is_regular_workspace, is_workspace};
use stowage_core::{Object, Pod};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Interval at which expired backoff entries are promoted to the active queue
pub const BACKOFF_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// A pod waiting to be scheduled
#[derive(Debug, Clone)]
pub struct QueuedPodInfo {
    pub pod: Arc<Pod>,
    /// Last time the pod was added to the queue or the backoff pool
    pub timestamp: Instant,
    /// Number of times the pod was popped for scheduling
    pub attempts: u32,
    /// First time the pod was queued
    pub initial_attempt_timestamp: Instant,
}

impl QueuedPodInfo {
    pub fn new(pod: Arc<Pod>) -> Self {
        let now = Instant::now();
        Self {
            pod,
            timestamp: now,
            attempts: 0,
            initial_attempt_timestamp: now,
        }
    }

    pub fn key(&self) -> String {
        self.pod.key()
    }
}

/// Orders queued pods. `Ordering::Less` means the first pod is popped first.
pub type Comparator = Arc<dyn Fn(&QueuedPodInfo, &QueuedPodInfo) -> Ordering + Send + Sync>;

fn priority_class(pod: &Pod) -> u8 {
    if is_regular_workspace(pod) {
        2
    } else if is_workspace(pod) {
        1
    } else {
        0
    }
}

/// Regular workspaces first, then other workspaces, then everything else.
/// Within a class older pods go first; the pod key makes the order total.
pub fn sort_by_priority(a: &QueuedPodInfo, b: &QueuedPodInfo) -> Ordering {
    priority_class(&b.pod)
        .cmp(&priority_class(&a.pod))
        .then_with(|| a.pod.creation_timestamp().cmp(&b.pod.creation_timestamp()))
        .then_with(|| a.key().cmp(&b.key()))
}

#[derive(Default)]
struct QueueState {
    /// Sorted so that the next pod to pop sits at the end
    active: Vec<QueuedPodInfo>,
    active_keys: HashSet<String>,
    backoff: HashMap<String, QueuedPodInfo>,
    closed: bool,
}

/// Queue of pending pods with a backoff pool for pods that failed to schedule
///
/// A pod key is tracked in at most one of the active queue and the backoff
/// pool. Popping blocks until a pod is available or the queue is closed.
pub struct PriorityQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    comparator: Comparator,
    initial_backoff: Duration,
    maximum_backoff: Duration,
}

impl PriorityQueue {
    pub fn new(comparator: Comparator, initial_backoff: Duration, maximum_backoff: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            comparator,
            initial_backoff,
            maximum_backoff,
        }
    }

    /// Queue ordered by [`sort_by_priority`]
    pub fn with_priority_order(initial_backoff: Duration, maximum_backoff: Duration) -> Self {
        Self::new(Arc::new(sort_by_priority), initial_backoff, maximum_backoff)
    }

    fn push_active(&self, state: &mut QueueState, info: QueuedPodInfo) {
        state.active_keys.insert(info.key());
        state.active.push(info);
        let comparator = &self.comparator;
        state.active.sort_by(|a, b| comparator(b, a));
    }

    /// Add a pod to the active queue. Returns false if the pod is already tracked.
    pub fn add(&self, pod: Arc<Pod>) -> bool {
        let info = QueuedPodInfo::new(pod);
        let key = info.key();
        {
            let mut state = self.state.lock();
            if state.active_keys.contains(&key) || state.backoff.contains_key(&key) {
                return false;
            }
            self.push_active(&mut state, info);
        }
        debug!("Queued pod {}", key);
        self.notify.notify_one();
        true
    }

    /// Put a pod that failed to schedule into the backoff pool.
    /// Returns false if the pod is already tracked.
    pub fn add_unschedulable(&self, mut info: QueuedPodInfo) -> bool {
        let key = info.key();
        let mut state = self.state.lock();
        if state.active_keys.contains(&key) || state.backoff.contains_key(&key) {
            return false;
        }
        info.timestamp = Instant::now();
        debug!("Pod {} backs off after {} attempts", key, info.attempts);
        state.backoff.insert(key, info);
        true
    }

    /// Wait for the highest priority pod. Returns `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<QueuedPodInfo> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(mut info) = state.active.pop() {
                    state.active_keys.remove(&info.key());
                    info.attempts += 1;
                    return Some(info);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Remove a pod from the active queue. The backoff pool is left alone.
    pub fn delete(&self, key: &str) -> bool {
        let mut state = self.state.lock();
        if !state.active_keys.remove(key) {
            return false;
        }
        state.active.retain(|info| info.key() != key);
        true
    }

    /// Promote every backoff entry regardless of its remaining backoff
    pub fn move_all_to_active(&self, reason: &str) {
        let moved = {
            let mut state = self.state.lock();
            let pending: Vec<QueuedPodInfo> = state.backoff.drain().map(|(_, info)| info).collect();
            let moved = pending.len();
            for info in pending {
                self.push_active(&mut state, info);
            }
            moved
        };
        if moved > 0 {
            debug!("Moved {} pods to the active queue: {}", moved, reason);
            for _ in 0..moved {
                self.notify.notify_one();
            }
        }
    }

    /// Promote backoff entries whose backoff has elapsed. Returns how many moved.
    pub fn flush_backoff_completed(&self) -> usize {
        let now = Instant::now();
        let moved = {
            let mut state = self.state.lock();
            let expired: Vec<String> = state
                .backoff
                .iter()
                .filter(|(_, info)| info.timestamp + self.backoff_duration(info.attempts) <= now)
                .map(|(key, _)| key.clone())
                .collect();
            for key in &expired {
                if let Some(info) = state.backoff.remove(key) {
                    self.push_active(&mut state, info);
                }
            }
            expired.len()
        };
        for _ in 0..moved {
            self.notify.notify_one();
        }
        moved
    }

    /// `initial * 2^(attempts-1)`, capped at the maximum
    pub fn backoff_duration(&self, attempts: u32) -> Duration {
        let mut duration = self.initial_backoff;
        for _ in 1..attempts {
            duration = duration.saturating_mul(2);
            if duration >= self.maximum_backoff {
                return self.maximum_backoff;
            }
        }
        duration.min(self.maximum_backoff)
    }

    /// Terminal: wakes every waiting `pop`
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn active_len(&self) -> usize {
        self.state.lock().active.len()
    }

    pub fn backoff_len(&self) -> usize {
        self.state.lock().backoff.len()
    }

    /// Periodically promote expired backoff entries until cancelled
    pub async fn run(&self, token: CancellationToken) {
        let mut interval = tokio::time::interval(BACKOFF_FLUSH_INTERVAL);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Backoff flusher shutting down");
                    return;
                }
                _ = interval.tick() => {
                    self.flush_backoff_completed();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use std::collections::BTreeMap;

    fn make_pod(name: &str, workspace_type: Option<&str>, age_secs: i64) -> Arc<Pod> {
        let mut pod = Pod::default();
        pod.metadata.name = Some(name.to_string());
        pod.metadata.namespace = Some("default".to_string());
        pod.metadata.creation_timestamp =
            Some(Time(Utc::now() - chrono::Duration::seconds(age_secs)));
        if let Some(workspace_type) = workspace_type {
            pod.metadata.labels = Some(BTreeMap::from([
                ("component".to_string(), "workspace".to_string()),
                ("workspaceType".to_string(), workspace_type.to_string()),
            ]));
        }
        Arc::new(pod)
    }

    fn make_queue() -> PriorityQueue {
        PriorityQueue::with_priority_order(Duration::from_secs(1), Duration::from_secs(4))
    }

    async fn pop_names(queue: &PriorityQueue, n: usize) -> Vec<String> {
        let mut names = Vec::new();
        for _ in 0..n {
            names.push(queue.pop().await.unwrap().pod.name().to_string());
        }
        names
    }

    #[tokio::test]
    async fn test_older_pods_pop_first() {
        let queue = make_queue();
        queue.add(make_pod("ws1", Some("regular"), 10));
        queue.add(make_pod("ws2", Some("regular"), 100));

        assert_eq!(pop_names(&queue, 2).await, vec!["ws2", "ws1"]);
    }

    #[tokio::test]
    async fn test_regular_workspaces_before_ghosts_and_others() {
        let queue = make_queue();
        queue.add(make_pod("other", None, 500));
        queue.add(make_pod("ghost", Some("ghost"), 300));
        queue.add(make_pod("regular", Some("regular"), 1));
        queue.add(make_pod("prebuild", Some("prebuild"), 400));

        assert_eq!(
            pop_names(&queue, 4).await,
            vec!["regular", "prebuild", "ghost", "other"]
        );
    }

    #[tokio::test]
    async fn test_pop_increments_attempts() {
        let queue = make_queue();
        queue.add(make_pod("ws1", Some("regular"), 1));

        let info = queue.pop().await.unwrap();
        assert_eq!(info.attempts, 1);

        queue.add_unschedulable(info);
        queue.move_all_to_active("test");
        let info = queue.pop().await.unwrap();
        assert_eq!(info.attempts, 2);
    }

    #[tokio::test]
    async fn test_no_duplicate_tracking() {
        let queue = make_queue();
        let pod = make_pod("ws1", Some("regular"), 1);

        assert!(queue.add(pod.clone()));
        assert!(!queue.add(pod.clone()));
        assert!(!queue.add_unschedulable(QueuedPodInfo::new(pod.clone())));
        assert_eq!(queue.active_len(), 1);
        assert_eq!(queue.backoff_len(), 0);

        let info = queue.pop().await.unwrap();
        assert!(queue.add_unschedulable(info.clone()));
        assert!(!queue.add_unschedulable(info));
        assert!(!queue.add(pod));
        assert_eq!(queue.active_len(), 0);
        assert_eq!(queue.backoff_len(), 1);
    }

    #[test]
    fn test_backoff_is_monotonic_and_capped() {
        let queue = make_queue();
        assert_eq!(queue.backoff_duration(0), Duration::from_secs(1));
        assert_eq!(queue.backoff_duration(1), Duration::from_secs(1));
        assert_eq!(queue.backoff_duration(2), Duration::from_secs(2));
        assert_eq!(queue.backoff_duration(3), Duration::from_secs(4));

        let mut previous = Duration::ZERO;
        for attempts in 0..100 {
            let duration = queue.backoff_duration(attempts);
            assert!(duration >= previous);
            assert!(duration <= Duration::from_secs(4));
            previous = duration;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_respects_backoff() {
        let queue = make_queue();
        queue.add(make_pod("ws1", Some("regular"), 1));
        let info = queue.pop().await.unwrap();
        queue.add(make_pod("ws2", Some("regular"), 1));
        let mut second = queue.pop().await.unwrap();
        second.attempts = 2;

        queue.add_unschedulable(info);
        queue.add_unschedulable(second);

        tokio::time::advance(Duration::from_millis(999)).await;
        assert_eq!(queue.flush_backoff_completed(), 0);

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(queue.flush_backoff_completed(), 1);
        assert_eq!(queue.pop().await.unwrap().pod.name(), "ws1");

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(queue.flush_backoff_completed(), 1);
        assert_eq!(queue.backoff_len(), 0);
    }

    #[tokio::test]
    async fn test_delete_only_touches_active_queue() {
        let queue = make_queue();
        let pod = make_pod("ws1", Some("regular"), 1);
        queue.add(pod.clone());
        assert!(queue.delete(&pod.key()));
        assert!(!queue.delete(&pod.key()));
        assert_eq!(queue.active_len(), 0);

        queue.add_unschedulable(QueuedPodInfo::new(pod.clone()));
        assert!(!queue.delete(&pod.key()));
        assert_eq!(queue.backoff_len(), 1);
    }

    #[tokio::test]
    async fn test_close_wakes_waiting_pop() {
        let queue = Arc::new(make_queue());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::task::yield_now().await;
        queue.close();
        assert!(waiter.await.unwrap().is_none());
        assert!(queue.is_closed());
    }

    #[tokio::test]
    async fn test_add_wakes_waiting_pop() {
        let queue = Arc::new(make_queue());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::task::yield_now().await;
        queue.add(make_pod("ws1", Some("regular"), 1));
        let info = waiter.await.unwrap().unwrap();
        assert_eq!(info.pod.name(), "ws1");
    }
}
