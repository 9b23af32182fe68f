use std::collections::BTreeSet;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use futures::Stream;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::Semaphore;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::assignment_store::AssignmentMap;
use crate::config::ShardingConfig;
use crate::entity::{EntityBehavior, RecipientOptions};
use crate::entity_manager::EntityManager;
use crate::error::ShardingError;
use crate::events::ShardingEvent;
use crate::mailbox_storage::MailboxStorage;
use crate::messenger::Messenger;
use crate::metrics::ClusterMetrics;
use crate::msg_id::MessageIdGenerator;
use crate::pods::Pods;
use crate::shard_manager_client::ShardManagerClient;
use crate::types::{EntityAddress, EntityId, EntityType, PodAddress, ShardId};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Events emitted when entity types are registered on this pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationEvent {
    EntityRegistered { entity_type: EntityType },
}

/// Per-pod sharding runtime.
///
/// Caches the cluster assignment map, owns one [`EntityManager`] per
/// registered entity type, routes envelopes locally or through the
/// transport, and drives the pod's registration lifecycle.
pub struct Sharding {
    config: Arc<ShardingConfig>,
    storage: Arc<dyn MailboxStorage>,
    pods: Arc<dyn Pods>,
    client: Arc<dyn ShardManagerClient>,
    metrics: Arc<ClusterMetrics>,
    is_shutdown: Arc<AtomicBool>,
    /// Local, eventually-consistent cache of the cluster map. Written
    /// only by the refresh path; readers take lock-free snapshots.
    assignments: ArcSwap<AssignmentMap>,
    entity_managers: DashMap<EntityType, Arc<EntityManager>>,
    /// One permit serializing structural changes to `entity_managers`.
    registry: Semaphore,
    /// Shards owned at the last refresh, to detect newly acquired shards
    /// that need their pending messages replayed.
    owned_shards: Mutex<BTreeSet<ShardId>>,
    events: broadcast::Sender<RegistrationEvent>,
    msg_ids: MessageIdGenerator,
    root_scope: CancellationToken,
}

impl Sharding {
    /// Build the runtime. Fails fast on invalid configuration.
    pub fn new(
        config: ShardingConfig,
        storage: Arc<dyn MailboxStorage>,
        pods: Arc<dyn Pods>,
        client: Arc<dyn ShardManagerClient>,
        metrics: Arc<ClusterMetrics>,
    ) -> Result<Arc<Self>, ShardingError> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let msg_ids = MessageIdGenerator::new(&config.pod_address);
        Ok(Arc::new(Self {
            config: Arc::new(config),
            storage,
            pods,
            client,
            metrics,
            is_shutdown: Arc::new(AtomicBool::new(false)),
            assignments: ArcSwap::from_pointee(AssignmentMap::new()),
            entity_managers: DashMap::new(),
            registry: Semaphore::new(1),
            owned_shards: Mutex::new(BTreeSet::new()),
            events,
            msg_ids,
            root_scope: CancellationToken::new(),
        }))
    }

    /// Register this pod with the shard manager, pull the first
    /// assignment snapshot, and launch the background refresh task.
    pub async fn start(self: &Arc<Self>) -> Result<(), ShardingError> {
        self.client.register(self.config.pod_address.clone()).await?;
        info!(pod = %self.config.pod_address, "pod registered");
        self.refresh_assignments().await;

        let runtime = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(runtime.config.refresh_assignments_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = runtime.root_scope.cancelled() => break,
                    _ = ticker.tick() => runtime.refresh_assignments().await,
                }
            }
        });
        Ok(())
    }

    pub fn local_address(&self) -> &PodAddress {
        &self.config.pod_address
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::Acquire)
    }

    /// Stable shard derivation for an entity id.
    pub fn get_shard_id(&self, entity_id: &EntityId) -> ShardId {
        crate::hash::shard_for_entity(entity_id.as_ref(), self.config.number_of_shards)
    }

    /// Build the full address for an entity of the given type.
    pub fn derive_address(&self, entity_type: EntityType, entity_id: EntityId) -> EntityAddress {
        EntityAddress::for_entity(entity_type, entity_id, self.config.number_of_shards)
    }

    /// Snapshot of the local assignment cache.
    pub fn assignments(&self) -> Arc<AssignmentMap> {
        self.assignments.load_full()
    }

    /// Whether the addressed entity's shard is currently owned locally.
    pub fn is_entity_on_local_shards(&self, address: &EntityAddress) -> bool {
        match self.assignments.load().get(&address.shard_id) {
            Some(Some(owner)) => owner == &self.config.pod_address,
            _ => false,
        }
    }

    /// Register an entity type with its behavior and default options;
    /// messages for it can be routed to this pod from then on.
    pub async fn register_entity(
        &self,
        behavior: Arc<dyn EntityBehavior>,
    ) -> Result<(), ShardingError> {
        self.register_entity_with_options(behavior, RecipientOptions::default())
            .await
    }

    /// Register an entity type with per-registration options (idle TTL
    /// override).
    pub async fn register_entity_with_options(
        &self,
        behavior: Arc<dyn EntityBehavior>,
        options: RecipientOptions,
    ) -> Result<(), ShardingError> {
        let entity_type = behavior.entity_type();
        if entity_type.is_empty() {
            return Err(ShardingError::InvalidConfig {
                reason: "entity type name must be nonempty".to_string(),
            });
        }

        let Ok(_permit) = self.registry.acquire().await else {
            return Err(ShardingError::InvalidConfig {
                reason: "entity registry closed".to_string(),
            });
        };
        if self.entity_managers.contains_key(&entity_type) {
            return Err(ShardingError::InvalidConfig {
                reason: format!("entity type {entity_type} already registered"),
            });
        }
        let manager = Arc::new(EntityManager::new(
            behavior,
            options,
            Arc::clone(&self.config),
            Arc::clone(&self.storage),
            Arc::clone(&self.metrics),
            &self.root_scope,
            Arc::clone(&self.is_shutdown),
        ));
        self.entity_managers.insert(entity_type.clone(), manager);
        debug!(entity_type = %entity_type, "entity type registered");
        let _ = self
            .events
            .send(RegistrationEvent::EntityRegistered { entity_type });
        Ok(())
    }

    /// Route an encoded envelope to the given pod: straight into the
    /// local entity manager when the pod is ourselves, through the
    /// transport otherwise. Transport unavailability is reported to the
    /// shard manager before surfacing to the caller.
    #[instrument(skip(self, encoded), fields(pod = %pod))]
    pub async fn send_envelope(
        &self,
        pod: &PodAddress,
        encoded: &Value,
    ) -> Result<(), ShardingError> {
        if pod == &self.config.pod_address {
            return self.send_to_local_entity_manager(encoded).await;
        }
        match self.pods.send(pod, encoded).await {
            Ok(()) => Ok(()),
            Err(e @ ShardingError::PodUnavailable { .. }) => {
                warn!(pod = %pod, "peer pod unavailable, notifying shard manager");
                if let Err(notify_err) = self
                    .client
                    .notify_unhealthy_pod(pod.clone())
                    .await
                {
                    warn!(pod = %pod, error = %notify_err, "failed to report unhealthy pod");
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Deliver an encoded envelope to the entity manager of its type,
    /// verifying that the target shard really is owned by this pod.
    pub async fn send_to_local_entity_manager(
        &self,
        encoded: &Value,
    ) -> Result<(), ShardingError> {
        if self.is_shutdown() {
            return Err(ShardingError::EntityNotManagedByPod { address: None });
        }

        let address: EntityAddress = encoded
            .get("address")
            .and_then(|a| serde_json::from_value(a.clone()).ok())
            .ok_or(ShardingError::EntityNotManagedByPod { address: None })?;

        if !self.is_entity_on_local_shards(&address) {
            return Err(ShardingError::not_managed(address));
        }
        let Some(manager) = self
            .entity_managers
            .get(&address.entity_type)
            .map(|m| Arc::clone(m.value()))
        else {
            return Err(ShardingError::not_managed(address));
        };
        manager.send(encoded).await
    }

    /// Create the user-facing facade for one entity type.
    pub fn make_messenger(self: &Arc<Self>, entity_type: EntityType) -> Messenger {
        Messenger::new(entity_type, Arc::clone(self))
    }

    /// Mint a primary key for an outgoing message.
    pub(crate) fn next_primary_key(&self) -> String {
        self.msg_ids.next_key()
    }

    pub(crate) fn config(&self) -> &ShardingConfig {
        &self.config
    }

    pub(crate) fn storage(&self) -> &Arc<dyn MailboxStorage> {
        &self.storage
    }

    /// Live entity instances across all entity types.
    pub fn active_entity_count(&self) -> usize {
        self.entity_managers
            .iter()
            .map(|m| m.value().active_count())
            .sum()
    }

    /// Look up a manager (for diagnostics and the in-process transport).
    pub fn entity_manager(&self, entity_type: &EntityType) -> Option<Arc<EntityManager>> {
        self.entity_managers
            .get(entity_type)
            .map(|m| Arc::clone(m.value()))
    }

    /// Subscribe to local registration events.
    pub fn registration_events(&self) -> Pin<Box<dyn Stream<Item = RegistrationEvent> + Send>> {
        let rx = self.events.subscribe();
        Box::pin(BroadcastStream::new(rx).filter_map(|item| item.ok()))
    }

    /// React to a cluster event pushed by the shard manager. Only
    /// `ShardsUnassigned` for this pod carries an instruction: terminate
    /// the entities living on the lost shards.
    pub async fn handle_sharding_event(&self, event: ShardingEvent) {
        match event {
            ShardingEvent::ShardsUnassigned { pod, shards }
                if pod == self.config.pod_address =>
            {
                info!(count = shards.len(), "terminating entities on unassigned shards");
                let managers: Vec<Arc<EntityManager>> = self
                    .entity_managers
                    .iter()
                    .map(|m| Arc::clone(m.value()))
                    .collect();
                for manager in managers {
                    manager.terminate_shards(&shards).await;
                }
                self.refresh_assignments().await;
            }
            other => debug!(event = ?other, "ignoring sharding event"),
        }
    }

    /// Pull the latest assignment map and replay pending messages for any
    /// shard this pod did not own before.
    pub async fn refresh_assignments(&self) {
        let map = match self.client.get_assignments().await {
            Ok(map) => map,
            Err(e) => {
                warn!(error = %e, "failed to refresh shard assignments");
                return;
            }
        };

        let local: BTreeSet<ShardId> = map
            .iter()
            .filter(|(_, owner)| owner.as_ref() == Some(&self.config.pod_address))
            .map(|(shard, _)| *shard)
            .collect();
        self.assignments.store(Arc::new(map));

        let acquired: Vec<ShardId> = {
            let mut owned = self.owned_shards.lock();
            let acquired = local.difference(&owned).copied().collect();
            *owned = local;
            acquired
        };
        if !acquired.is_empty() {
            self.replay_pending(acquired).await;
        }
    }

    /// Crash-then-recover path: feed still-pending persisted entries for
    /// newly acquired shards back into the local entity managers.
    async fn replay_pending(&self, shards: Vec<ShardId>) {
        let entries = match self.storage.unprocessed_entries(&shards).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "failed to load pending entries for replay");
                return;
            }
        };
        if entries.is_empty() {
            return;
        }
        info!(count = entries.len(), "replaying pending entries");
        for entry in entries {
            let Some(manager) = self.entity_manager(&entry.entity_type) else {
                debug!(
                    entity_type = %entry.entity_type,
                    "no manager registered for pending entry, leaving it in storage"
                );
                continue;
            };
            let address = entry.address();
            if let Err(e) = manager.deliver(entry).await {
                warn!(address = %address, error = %e, "failed to replay pending entry");
            }
        }
    }

    /// Graceful shutdown: refuse new entities, drain and close every
    /// entity manager, then unregister from the shard manager. Failures
    /// past the first step are logged and swallowed so the pod can exit.
    pub async fn shutdown(&self) {
        if self.is_shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(pod = %self.config.pod_address, "pod shutting down");

        let managers: Vec<(EntityType, Arc<EntityManager>)> = self
            .entity_managers
            .iter()
            .map(|m| (m.key().clone(), Arc::clone(m.value())))
            .collect();
        for (entity_type, manager) in managers {
            debug!(entity_type = %entity_type, "closing entity manager");
            manager.close().await;
        }

        if let Err(e) = self
            .client
            .unregister(self.config.pod_address.clone())
            .await
        {
            warn!(error = %e, "failed to unregister from shard manager");
        }
        self.root_scope.cancel();
    }
}
