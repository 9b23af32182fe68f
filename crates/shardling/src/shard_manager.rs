use std::collections::{BTreeMap, BTreeSet};
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::assignment_store::{AssignmentMap, AssignmentStore};
use crate::config::ManagerConfig;
use crate::error::ShardingError;
use crate::events::ShardingEvent;
use crate::metrics::ClusterMetrics;
use crate::pods::Pods;
use crate::pods_health::PodsHealth;
use crate::rebalance::{plan_rebalance, ShardMove};
use crate::shard_manager_client::ShardManagerClient;
use crate::types::{PodAddress, ShardId};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Authoritative control plane for the cluster: owns the registered pod
/// set and the shard-to-pod assignment map, rebalances on membership
/// changes, sweeps pod health, and broadcasts [`ShardingEvent`]s.
///
/// The in-memory map is the source of truth while the manager runs;
/// [`AssignmentStore`] carries it across manager restarts.
pub struct ShardManager {
    config: ManagerConfig,
    store: Arc<dyn AssignmentStore>,
    pods_api: Arc<dyn Pods>,
    health: Arc<dyn PodsHealth>,
    metrics: Arc<ClusterMetrics>,
    state: Mutex<ManagerState>,
    /// Serializes rebalance passes so concurrent triggers cannot
    /// interleave their unassign/assign phases.
    rebalance_gate: tokio::sync::Mutex<()>,
    events: broadcast::Sender<ShardingEvent>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct ManagerState {
    pods: BTreeSet<PodAddress>,
    assignments: AssignmentMap,
    /// Shards whose source pod could not be told to terminate entities
    /// during a move. The assignment change stands; the instruction is
    /// retried on `rebalance_retry_interval`.
    pending_terminations: BTreeMap<PodAddress, BTreeSet<ShardId>>,
}

impl ShardManager {
    /// Create a manager. Fails fast on invalid configuration.
    pub fn new(
        config: ManagerConfig,
        store: Arc<dyn AssignmentStore>,
        pods_api: Arc<dyn Pods>,
        health: Arc<dyn PodsHealth>,
        metrics: Arc<ClusterMetrics>,
    ) -> Result<Arc<Self>, ShardingError> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let mut assignments = AssignmentMap::new();
        for id in 0..config.number_of_shards {
            assignments.insert(ShardId::new(id), None);
        }
        Ok(Arc::new(Self {
            config,
            store,
            pods_api,
            health,
            metrics,
            state: Mutex::new(ManagerState {
                assignments,
                ..Default::default()
            }),
            rebalance_gate: tokio::sync::Mutex::new(()),
            events,
            cancel: CancellationToken::new(),
        }))
    }

    /// Seed assignments from the store and launch the periodic loops
    /// (rebalance, health sweep, termination retry).
    pub async fn start(self: &Arc<Self>) -> Result<(), ShardingError> {
        match self.store.read().await {
            Ok(persisted) if !persisted.is_empty() => {
                let mut state = self.state.lock();
                for (shard, owner) in persisted {
                    if shard.0 < self.config.number_of_shards {
                        state.assignments.insert(shard, owner);
                    }
                }
                info!("seeded shard assignments from store");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "failed to read persisted assignments, starting empty"),
        }
        self.update_shard_gauges();

        let rebalancer = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(rebalancer.config.rebalance_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = rebalancer.cancel.cancelled() => break,
                    _ = ticker.tick() => rebalancer.rebalance(false).await,
                }
            }
        });

        let sweeper = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweeper.config.pod_health_check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = sweeper.cancel.cancelled() => break,
                    _ = ticker.tick() => sweeper.check_pod_health().await,
                }
            }
        });

        let retrier = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(retrier.config.rebalance_retry_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = retrier.cancel.cancelled() => break,
                    _ = ticker.tick() => retrier.retry_pending_terminations().await,
                }
            }
        });

        Ok(())
    }

    /// Stop the periodic loops. Pods keep their current assignments.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Add a pod to the cluster and run a rebalance pass for it.
    #[instrument(skip(self), fields(pod = %pod))]
    pub async fn register(&self, pod: PodAddress) {
        let added = self.state.lock().pods.insert(pod.clone());
        if !added {
            debug!("pod already registered");
            return;
        }
        info!("pod registered");
        self.update_pod_gauges();
        self.publish(ShardingEvent::PodRegistered { pod });
        self.rebalance(false).await;
    }

    /// Remove a pod, release its shards, and reassign them immediately.
    #[instrument(skip(self), fields(pod = %pod))]
    pub async fn unregister(&self, pod: PodAddress) {
        let released: BTreeSet<ShardId> = {
            let mut state = self.state.lock();
            if !state.pods.remove(&pod) {
                debug!("pod was not registered");
                return;
            }
            state.pending_terminations.remove(&pod);
            let released = shards_owned_by(&state.assignments, &pod);
            for shard in &released {
                state.assignments.insert(*shard, None);
            }
            released
        };
        info!(released = released.len(), "pod unregistered");

        if let Err(e) = self.persist_assignments().await {
            // The pod is gone either way; keep the in-memory truth moving
            // and let the next successful write catch the store up.
            error!(error = %e, "failed to persist assignments after unregister");
        }
        self.update_pod_gauges();
        self.update_shard_gauges();
        if !released.is_empty() {
            self.publish(ShardingEvent::ShardsUnassigned {
                pod: pod.clone(),
                shards: released,
            });
        }
        self.publish(ShardingEvent::PodUnregistered { pod });
        self.rebalance(true).await;
    }

    /// Snapshot of the current assignment map.
    pub fn get_assignments(&self) -> AssignmentMap {
        self.state.lock().assignments.clone()
    }

    /// Currently registered pods.
    pub fn get_pods(&self) -> BTreeSet<PodAddress> {
        self.state.lock().pods.clone()
    }

    /// Infinite stream of cluster events. Slow subscribers that fall more
    /// than the channel capacity behind lose the oldest events.
    pub fn get_sharding_events(&self) -> Pin<Box<dyn Stream<Item = ShardingEvent> + Send>> {
        let rx = self.events.subscribe();
        Box::pin(BroadcastStream::new(rx).filter_map(|item| match item {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                warn!(missed, "sharding event subscriber lagged");
                None
            }
        }))
    }

    /// Validate an unhealthy-pod report and evict the pod if it really is
    /// unreachable.
    #[instrument(skip(self), fields(pod = %pod))]
    pub async fn notify_unhealthy_pod(&self, pod: PodAddress) {
        if !self.state.lock().pods.contains(&pod) {
            return;
        }
        match self.health.is_alive(&pod).await {
            Ok(true) => debug!("reported pod is still alive"),
            Ok(false) => {
                warn!("pod confirmed dead, evicting");
                self.unregister(pod).await;
            }
            Err(e) => warn!(error = %e, "health probe failed, keeping pod"),
        }
    }

    /// Probe every registered pod; evict those that fail the ping within
    /// `pod_ping_timeout`.
    pub async fn check_pod_health(&self) {
        let pods = self.get_pods();
        let mut healthy = 0i64;
        for pod in pods {
            let alive = tokio::time::timeout(
                self.config.pod_ping_timeout,
                self.pods_api.ping(&pod),
            )
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false);
            self.publish(ShardingEvent::PodHealthChecked { pod: pod.clone() });
            if alive {
                healthy += 1;
            } else {
                warn!(pod = %pod, "pod failed health ping");
                self.notify_unhealthy_pod(pod).await;
            }
        }
        self.metrics.pods_healthy.set(healthy);
    }

    /// Recompute assignments and apply the resulting plan.
    ///
    /// When shards are unowned (after an eviction, or on a fresh cluster)
    /// the pass places them all. Otherwise a non-immediate pass applies at
    /// most `ceil(rebalance_rate * number_of_shards)` balance moves;
    /// remaining imbalance waits for the next tick.
    pub async fn rebalance(&self, immediate: bool) {
        let _gate = self.rebalance_gate.lock().await;

        let (assignments, pods) = {
            let state = self.state.lock();
            (state.assignments.clone(), state.pods.clone())
        };
        if pods.is_empty() {
            return;
        }

        let plan = plan_rebalance(
            &assignments,
            &pods,
            self.config.number_of_shards,
            self.config.rebalance_rate,
        );
        // Placing unowned shards takes priority over balance moves: a
        // shard without an owner serves nobody. Balance movement only
        // happens in passes that found every shard owned.
        let (placements, moves) = if immediate || !plan.assign_unowned.is_empty() {
            (plan.assign_unowned, Vec::new())
        } else {
            (BTreeMap::new(), plan.moves)
        };
        if placements.is_empty() && moves.is_empty() {
            return;
        }

        if !moves.is_empty() {
            self.apply_unassignments(&moves).await;
        }

        let mut assigned: BTreeMap<PodAddress, BTreeSet<ShardId>> = BTreeMap::new();
        {
            let mut state = self.state.lock();
            for (shard, pod) in &placements {
                state.assignments.insert(*shard, Some(pod.clone()));
                assigned.entry(pod.clone()).or_default().insert(*shard);
            }
            for mv in &moves {
                state.assignments.insert(mv.shard, Some(mv.to.clone()));
                assigned.entry(mv.to.clone()).or_default().insert(mv.shard);
            }
        }
        if let Err(e) = self.persist_assignments().await {
            error!(error = %e, "failed to persist assignments after rebalance");
        }
        self.update_shard_gauges();
        for (pod, shards) in assigned {
            debug!(pod = %pod, shards = shards.len(), "shards assigned");
            self.publish(ShardingEvent::ShardsAssigned { pod, shards });
        }
        self.metrics.rebalances.inc();
    }

    /// Phase one of a move: mark the shards unowned, tell the source pods
    /// to terminate the affected entities, and record the instruction for
    /// retry when a pod cannot be reached. Assignment changes are never
    /// rolled back on a failed instruction.
    async fn apply_unassignments(&self, moves: &[ShardMove]) {
        let mut by_source: BTreeMap<PodAddress, BTreeSet<ShardId>> = BTreeMap::new();
        {
            let mut state = self.state.lock();
            for mv in moves {
                state.assignments.insert(mv.shard, None);
                by_source
                    .entry(mv.from.clone())
                    .or_default()
                    .insert(mv.shard);
            }
        }
        if let Err(e) = self.persist_assignments().await {
            error!(error = %e, "failed to persist assignments during unassignment");
        }

        for (pod, shards) in by_source {
            self.publish(ShardingEvent::ShardsUnassigned {
                pod: pod.clone(),
                shards: shards.clone(),
            });
            self.instruct_termination(pod, shards).await;
        }
    }

    async fn instruct_termination(&self, pod: PodAddress, shards: BTreeSet<ShardId>) {
        let event = ShardingEvent::ShardsUnassigned {
            pod: pod.clone(),
            shards: shards.clone(),
        };
        if let Err(e) = self.pods_api.notify(&pod, &event).await {
            warn!(pod = %pod, error = %e, "failed to instruct entity termination, will retry");
            self.state
                .lock()
                .pending_terminations
                .entry(pod)
                .or_default()
                .extend(shards);
        }
    }

    async fn retry_pending_terminations(&self) {
        let pending: Vec<(PodAddress, BTreeSet<ShardId>)> = {
            let mut state = self.state.lock();
            let drained: Vec<_> = state
                .pending_terminations
                .iter()
                .map(|(pod, shards)| (pod.clone(), shards.clone()))
                .collect();
            state.pending_terminations.clear();
            // Skip pods that are no longer registered: eviction already
            // released their shards.
            drained
                .into_iter()
                .filter(|(pod, _)| state.pods.contains(pod))
                .collect()
        };
        for (pod, shards) in pending {
            self.instruct_termination(pod, shards).await;
        }
    }

    /// Write the current map through the store, retrying up to
    /// `persist_retry_count` times.
    async fn persist_assignments(&self) -> Result<(), ShardingError> {
        let assignments = self.get_assignments();
        let mut attempt = 0u32;
        loop {
            match self.store.write(&assignments).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.config.persist_retry_count => {
                    attempt += 1;
                    debug!(attempt, error = %e, "assignment persist failed, retrying");
                    tokio::time::sleep(self.config.persist_retry_interval).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn publish(&self, event: ShardingEvent) {
        let _ = self.events.send(event);
    }

    fn update_pod_gauges(&self) {
        let count = self.state.lock().pods.len() as i64;
        self.metrics.pods.set(count);
    }

    fn update_shard_gauges(&self) {
        let (assigned, unassigned) = {
            let state = self.state.lock();
            let assigned = state.assignments.values().filter(|o| o.is_some()).count();
            (assigned, state.assignments.len() - assigned)
        };
        self.metrics.shards_assigned.set(assigned as i64);
        self.metrics.shards_unassigned.set(unassigned as i64);
    }
}

fn shards_owned_by(assignments: &AssignmentMap, pod: &PodAddress) -> BTreeSet<ShardId> {
    assignments
        .iter()
        .filter(|(_, owner)| owner.as_ref() == Some(pod))
        .map(|(shard, _)| *shard)
        .collect()
}

/// In-process client handle: pods colocated with the manager (tests,
/// single-binary deployments) talk to it without a transport.
#[async_trait]
impl ShardManagerClient for ShardManager {
    async fn register(&self, pod: PodAddress) -> Result<(), ShardingError> {
        ShardManager::register(self, pod).await;
        Ok(())
    }

    async fn unregister(&self, pod: PodAddress) -> Result<(), ShardingError> {
        ShardManager::unregister(self, pod).await;
        Ok(())
    }

    async fn notify_unhealthy_pod(&self, pod: PodAddress) -> Result<(), ShardingError> {
        ShardManager::notify_unhealthy_pod(self, pod).await;
        Ok(())
    }

    async fn get_assignments(&self) -> Result<AssignmentMap, ShardingError> {
        Ok(ShardManager::get_assignments(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory_assignment::MemoryAssignmentStore;
    use crate::storage::noop_health::NoopPodsHealth;
    use crate::storage::noop_pods::NoopPods;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn pod(n: u8) -> PodAddress {
        PodAddress::new(format!("10.0.0.{n}"), 8080)
    }

    fn manager_config(shards: u32) -> ManagerConfig {
        ManagerConfig {
            number_of_shards: shards,
            rebalance_rate: 1.0,
            persist_retry_interval: Duration::from_millis(10),
            persist_retry_count: 3,
            ..Default::default()
        }
    }

    fn make_manager(shards: u32) -> (Arc<ShardManager>, Arc<MemoryAssignmentStore>) {
        let store = Arc::new(MemoryAssignmentStore::new());
        let manager = ShardManager::new(
            manager_config(shards),
            Arc::clone(&store) as Arc<dyn AssignmentStore>,
            Arc::new(NoopPods),
            Arc::new(NoopPodsHealth),
            Arc::new(ClusterMetrics::unregistered()),
        )
        .unwrap();
        (manager, store)
    }

    fn owned_count(manager: &ShardManager, pod: &PodAddress) -> usize {
        shards_owned_by(&manager.get_assignments(), pod).len()
    }

    #[tokio::test]
    async fn register_assigns_all_shards_to_first_pod() {
        let (manager, _) = make_manager(12);
        manager.register(pod(1)).await;
        assert_eq!(owned_count(&manager, &pod(1)), 12);
    }

    #[tokio::test]
    async fn second_pod_balances_over_time() {
        let (manager, _) = make_manager(12);
        manager.register(pod(1)).await;
        manager.register(pod(2)).await;
        // With rate 1.0 a single pass fully balances.
        assert_eq!(owned_count(&manager, &pod(1)), 6);
        assert_eq!(owned_count(&manager, &pod(2)), 6);
    }

    #[tokio::test]
    async fn rate_limits_balance_moves_per_pass() {
        let store = Arc::new(MemoryAssignmentStore::new());
        let manager = ShardManager::new(
            ManagerConfig {
                number_of_shards: 12,
                rebalance_rate: 0.25,
                ..Default::default()
            },
            store as Arc<dyn AssignmentStore>,
            Arc::new(NoopPods),
            Arc::new(NoopPodsHealth),
            Arc::new(ClusterMetrics::unregistered()),
        )
        .unwrap();
        manager.register(pod(1)).await;
        manager.register(pod(2)).await;
        // ceil(0.25 * 12) = 3 shards moved on the pass triggered by the
        // second registration.
        assert_eq!(owned_count(&manager, &pod(2)), 3);
        manager.rebalance(false).await;
        assert_eq!(owned_count(&manager, &pod(2)), 6);
    }

    #[tokio::test]
    async fn unregister_releases_and_reassigns() {
        let (manager, _) = make_manager(12);
        manager.register(pod(1)).await;
        manager.register(pod(2)).await;
        manager.unregister(pod(2)).await;
        assert_eq!(owned_count(&manager, &pod(1)), 12);
        assert_eq!(owned_count(&manager, &pod(2)), 0);
    }

    #[tokio::test]
    async fn unregister_unknown_pod_is_noop() {
        let (manager, _) = make_manager(4);
        manager.register(pod(1)).await;
        manager.unregister(pod(9)).await;
        assert_eq!(owned_count(&manager, &pod(1)), 4);
    }

    #[tokio::test]
    async fn assignments_survive_manager_restart() {
        let (manager, store) = make_manager(8);
        manager.register(pod(1)).await;
        let before = manager.get_assignments();

        let restarted = ShardManager::new(
            manager_config(8),
            Arc::clone(&store) as Arc<dyn AssignmentStore>,
            Arc::new(NoopPods),
            Arc::new(NoopPodsHealth),
            Arc::new(ClusterMetrics::unregistered()),
        )
        .unwrap();
        restarted.start().await.unwrap();
        assert_eq!(restarted.get_assignments(), before);
        restarted.shutdown();
    }

    #[tokio::test]
    async fn persist_retries_until_store_recovers() {
        let (manager, store) = make_manager(4);
        store.fail_next_writes(2);
        manager.register(pod(1)).await;
        // Two failures were consumed by retries; the final state is stored.
        let persisted = store.read().await.unwrap();
        assert_eq!(shards_owned_by(&persisted, &pod(1)).len(), 4);
    }

    #[tokio::test]
    async fn events_are_broadcast() {
        let (manager, _) = make_manager(4);
        let mut events = manager.get_sharding_events();
        manager.register(pod(1)).await;

        let first = events.next().await.unwrap();
        assert_eq!(first, ShardingEvent::PodRegistered { pod: pod(1) });
        let second = events.next().await.unwrap();
        match second {
            ShardingEvent::ShardsAssigned { pod: p, shards } => {
                assert_eq!(p, pod(1));
                assert_eq!(shards.len(), 4);
            }
            other => panic!("expected ShardsAssigned, got {other:?}"),
        }
    }

    struct FlakyHealth {
        alive: AtomicBool,
    }

    #[async_trait]
    impl PodsHealth for FlakyHealth {
        async fn is_alive(&self, _address: &PodAddress) -> Result<bool, ShardingError> {
            Ok(self.alive.load(Ordering::Acquire))
        }
    }

    #[tokio::test]
    async fn unhealthy_report_is_validated_before_eviction() {
        let health = Arc::new(FlakyHealth {
            alive: AtomicBool::new(true),
        });
        let manager = ShardManager::new(
            manager_config(4),
            Arc::new(MemoryAssignmentStore::new()) as Arc<dyn AssignmentStore>,
            Arc::new(NoopPods),
            Arc::clone(&health) as Arc<dyn PodsHealth>,
            Arc::new(ClusterMetrics::unregistered()),
        )
        .unwrap();
        manager.register(pod(1)).await;

        // Alive: the report is ignored.
        manager.notify_unhealthy_pod(pod(1)).await;
        assert!(manager.get_pods().contains(&pod(1)));

        // Dead: the report evicts.
        health.alive.store(false, Ordering::Release);
        manager.notify_unhealthy_pod(pod(1)).await;
        assert!(manager.get_pods().is_empty());
    }

    struct CountingPods {
        notifies: std::sync::atomic::AtomicUsize,
        fail_notifies: AtomicBool,
    }

    #[async_trait]
    impl Pods for CountingPods {
        async fn send(&self, pod: &PodAddress, _envelope: &Value) -> Result<(), ShardingError> {
            Err(ShardingError::PodUnavailable {
                address: pod.clone(),
                source: None,
            })
        }

        async fn ping(&self, _pod: &PodAddress) -> Result<(), ShardingError> {
            Ok(())
        }

        async fn notify(
            &self,
            pod: &PodAddress,
            _event: &ShardingEvent,
        ) -> Result<(), ShardingError> {
            self.notifies.fetch_add(1, Ordering::AcqRel);
            if self.fail_notifies.load(Ordering::Acquire) {
                Err(ShardingError::PodUnavailable {
                    address: pod.clone(),
                    source: None,
                })
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn failed_termination_is_retried_without_rollback() {
        let pods_api = Arc::new(CountingPods {
            notifies: std::sync::atomic::AtomicUsize::new(0),
            fail_notifies: AtomicBool::new(true),
        });
        let manager = ShardManager::new(
            manager_config(8),
            Arc::new(MemoryAssignmentStore::new()) as Arc<dyn AssignmentStore>,
            Arc::clone(&pods_api) as Arc<dyn Pods>,
            Arc::new(NoopPodsHealth),
            Arc::new(ClusterMetrics::unregistered()),
        )
        .unwrap();
        manager.register(pod(1)).await;
        manager.register(pod(2)).await;

        // The balance pass moved shards off pod 1 even though the
        // termination instruction failed.
        assert_eq!(owned_count(&manager, &pod(2)), 4);
        assert!(!manager.state.lock().pending_terminations.is_empty());

        pods_api.fail_notifies.store(false, Ordering::Release);
        manager.retry_pending_terminations().await;
        assert!(manager.state.lock().pending_terminations.is_empty());
    }
}
