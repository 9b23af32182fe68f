use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use crate::config::ShardingConfig;
use crate::entity::{EntityBehavior, EntityContext, EntityMessage, RecipientOptions};
use crate::envelope::Envelope;
use crate::error::ShardingError;
use crate::mailbox;
use crate::mailbox_storage::{Entry, MailboxStorage, SaveOutcome};
use crate::metrics::ClusterMetrics;
use crate::replier::{now_millis, Replier};
use crate::types::{EntityAddress, ShardId};

/// Supervises every live instance of one entity type on this pod.
///
/// Decodes and persists incoming envelopes, spawns instances on first
/// message, feeds their mailboxes, expires idle instances, and terminates
/// them on shard movement or shutdown.
pub struct EntityManager {
    behavior: Arc<dyn EntityBehavior>,
    options: RecipientOptions,
    config: Arc<ShardingConfig>,
    storage: Arc<dyn MailboxStorage>,
    metrics: Arc<ClusterMetrics>,
    entities: Arc<DashMap<EntityAddress, EntitySlot>>,
    /// One permit: every structural change to `entities` (create,
    /// terminate, remove) holds it. Reads are lock-free snapshots.
    structure: Arc<Semaphore>,
    /// Child of the pod's root scope; closing it tears down every entity.
    scope: CancellationToken,
    /// Shared with the owning runtime: set before managers are closed.
    is_shutdown: Arc<AtomicBool>,
}

/// Lifecycle of a map slot. The transition `Active -> Terminating ->
/// (removed)` is linear and happens under the structure semaphore.
#[derive(Clone)]
enum EntitySlot {
    Active(Arc<EntityState>),
    Terminating,
}

struct EntityState {
    sender: mailbox::MailboxSender<EntityMessage>,
    scope: CancellationToken,
    /// Millis of the last *processed* message (not enqueue); written by
    /// repliers, read by the expiration task. Monotonically nondecreasing.
    last_active_ms: Arc<AtomicI64>,
    /// Accepted-but-uncompleted messages, for graceful drain.
    in_flight: Arc<AtomicUsize>,
}

impl EntityManager {
    pub fn new(
        behavior: Arc<dyn EntityBehavior>,
        options: RecipientOptions,
        config: Arc<ShardingConfig>,
        storage: Arc<dyn MailboxStorage>,
        metrics: Arc<ClusterMetrics>,
        parent_scope: &CancellationToken,
        is_shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            behavior,
            options,
            config,
            storage,
            metrics,
            entities: Arc::new(DashMap::new()),
            structure: Arc::new(Semaphore::new(1)),
            scope: parent_scope.child_token(),
            is_shutdown,
        }
    }

    pub fn entity_type(&self) -> crate::types::EntityType {
        self.behavior.entity_type()
    }

    /// Number of live (non-terminating) entity instances.
    pub fn active_count(&self) -> usize {
        self.entities
            .iter()
            .filter(|e| matches!(e.value(), EntitySlot::Active(_)))
            .count()
    }

    pub fn contains(&self, address: &EntityAddress) -> bool {
        matches!(
            self.entities.get(address).as_deref(),
            Some(EntitySlot::Active(_))
        )
    }

    /// Accept an encoded envelope for an entity of this type.
    ///
    /// Pipeline: decode (bad address -> `EntityNotManagedByPod`, bad
    /// message -> `MalformedMessage`), persist, then enqueue to the
    /// instance's in-memory mailbox. Persistence failures are logged and
    /// swallowed; a storage miss drops the send silently.
    #[instrument(skip(self, encoded), fields(entity_type = %self.behavior.entity_type()))]
    pub async fn send(&self, encoded: &Value) -> Result<(), ShardingError> {
        let envelope = Envelope::decode(encoded)?;
        let address = envelope.address;

        if address.entity_type != self.behavior.entity_type()
            || crate::hash::shard_for_entity(
                address.entity_id.as_ref(),
                self.config.number_of_shards,
            ) != address.shard_id
        {
            return Err(ShardingError::not_managed(address));
        }

        let entry = match self.storage.save_message(&address, &envelope.message).await {
            Ok(SaveOutcome::Saved(entry)) => {
                self.metrics.messages_persisted.inc();
                entry
            }
            Ok(SaveOutcome::Duplicate { .. }) => {
                debug!(
                    address = %address,
                    primary_key = %envelope.message.primary_key,
                    "duplicate message, already persisted"
                );
                return Ok(());
            }
            Err(ShardingError::NoSuchElement { reason }) => {
                debug!(address = %address, reason, "storage miss, dropping send");
                return Ok(());
            }
            Err(e @ ShardingError::MessagePersistenceError { .. }) => {
                error!(address = %address, error = %e, "failed to persist message");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        self.deliver(entry).await
    }

    /// Enqueue a persisted entry to its entity, creating the instance if
    /// needed. Retries the offer after `send_retry_interval` when it races
    /// with a concurrent termination: the next resolution either recreates
    /// the entity or fails fast once the pod is shutting down.
    pub(crate) async fn deliver(&self, entry: Entry) -> Result<(), ShardingError> {
        let address = entry.address();
        loop {
            let Some(state) = self.resolve(&address).await? else {
                tokio::time::sleep(self.config.send_retry_interval).await;
                continue;
            };

            state.in_flight.fetch_add(1, Ordering::AcqRel);
            let message = EntityMessage {
                message: entry.message.clone(),
                sequence_number: entry.sequence_number,
                replier: Replier::new(
                    address.clone(),
                    entry.message.primary_key.clone(),
                    Arc::clone(&self.storage),
                    Arc::clone(&state.last_active_ms),
                    Arc::clone(&state.in_flight),
                ),
            };
            match state.sender.offer(message) {
                Ok(()) => return Ok(()),
                Err(_rejected) => {
                    state.in_flight.fetch_sub(1, Ordering::AcqRel);
                    debug!(address = %address, "mailbox offer failed, retrying");
                    tokio::time::sleep(self.config.send_retry_interval).await;
                }
            }
        }
    }

    /// Terminate one entity. Absence is a no-op.
    pub async fn terminate_entity(&self, address: &EntityAddress) {
        Self::terminate_slot(&self.entities, &self.structure, address).await;
    }

    /// Terminate every entity living on one of the given shards.
    pub async fn terminate_shards(&self, shards: &BTreeSet<ShardId>) {
        let doomed: Vec<EntityAddress> = self
            .entities
            .iter()
            .filter(|e| shards.contains(&e.key().shard_id))
            .map(|e| e.key().clone())
            .collect();
        for address in doomed {
            self.terminate_entity(&address).await;
        }
    }

    /// Gracefully close the manager: wait for in-flight messages to drain
    /// (bounded by `entity_termination_timeout`), then close every entity
    /// scope and the manager scope.
    pub async fn close(&self) {
        let deadline = Instant::now() + self.config.entity_termination_timeout;
        loop {
            let draining = self.entities.iter().any(|e| match e.value() {
                EntitySlot::Active(state) => state.in_flight.load(Ordering::Acquire) > 0,
                EntitySlot::Terminating => false,
            });
            if !draining {
                break;
            }
            if Instant::now() >= deadline {
                warn!(
                    entity_type = %self.behavior.entity_type(),
                    "entity termination timeout expired, forcing close"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let addresses: Vec<EntityAddress> =
            self.entities.iter().map(|e| e.key().clone()).collect();
        for address in addresses {
            self.terminate_entity(&address).await;
        }
        self.scope.cancel();
    }

    /// Look up the entity's live state, creating it when absent.
    ///
    /// `None` means a terminating instance still occupies the slot; the
    /// caller backs off and retries. Creation is serialized by the
    /// structure semaphore and fails once the pod is shutting down.
    async fn resolve(
        &self,
        address: &EntityAddress,
    ) -> Result<Option<Arc<EntityState>>, ShardingError> {
        if let Some(slot) = self.entities.get(address) {
            return Ok(match slot.value() {
                EntitySlot::Active(state) => Some(Arc::clone(state)),
                EntitySlot::Terminating => None,
            });
        }

        let Ok(_permit) = self.structure.acquire().await else {
            return Err(ShardingError::not_managed(address.clone()));
        };

        // Re-check under the permit; another sender may have won the race.
        if let Some(slot) = self.entities.get(address) {
            return Ok(match slot.value() {
                EntitySlot::Active(state) => Some(Arc::clone(state)),
                EntitySlot::Terminating => None,
            });
        }

        if self.is_shutdown.load(Ordering::Acquire) {
            return Err(ShardingError::not_managed(address.clone()));
        }

        let scope = self.scope.child_token();
        let (sender, entity_mailbox) = mailbox::mailbox();
        let state = Arc::new(EntityState {
            sender: sender.clone(),
            scope: scope.clone(),
            last_active_ms: Arc::new(AtomicI64::new(now_millis())),
            in_flight: Arc::new(AtomicUsize::new(0)),
        });

        self.metrics
            .entities
            .with_label_values(&[self.behavior.entity_type().as_ref()])
            .inc();
        self.entities
            .insert(address.clone(), EntitySlot::Active(Arc::clone(&state)));

        let ctx = EntityContext {
            address: address.clone(),
            pod_address: self.config.pod_address.clone(),
            scope: scope.clone(),
        };
        let behavior = Arc::clone(&self.behavior);
        let entities = Arc::clone(&self.entities);
        let structure = Arc::clone(&self.structure);
        let metrics = Arc::clone(&self.metrics);
        let entity_type = self.behavior.entity_type();
        let task_address = address.clone();
        let task_scope = scope.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = task_scope.cancelled() => Ok(()),
                r = behavior.run(ctx, entity_mailbox) => r,
            };
            if let Err(e) = result {
                warn!(address = %task_address, error = %e, "entity behavior failed");
            }
            // Behavior exit closes the scope; finalizers then release the
            // mailbox, the expiration task, the map entry, and the gauge.
            sender.shutdown();
            task_scope.cancel();
            if let Ok(_permit) = structure.acquire().await {
                entities.remove(&task_address);
            }
            metrics
                .entities
                .with_label_values(&[entity_type.as_ref()])
                .dec();
        });

        self.spawn_expiration(address.clone(), &state);

        Ok(Some(state))
    }

    /// Idle watchdog: sleeps the idle budget, re-sleeps whatever remains
    /// since the last processed message, and terminates the entity once
    /// the budget is truly exhausted.
    fn spawn_expiration(&self, address: EntityAddress, state: &EntityState) {
        // Registration options beat the behavior's default, which beats
        // the pod-wide config.
        let max_idle = self
            .options
            .max_idle_time
            .or_else(|| self.behavior.max_idle_time())
            .unwrap_or(self.config.entity_max_idle_time);
        let scope = state.scope.clone();
        let last_active = Arc::clone(&state.last_active_ms);
        let entities = Arc::clone(&self.entities);
        let structure = Arc::clone(&self.structure);
        tokio::spawn(async move {
            let mut sleep_for = max_idle;
            loop {
                tokio::select! {
                    biased;
                    _ = scope.cancelled() => return,
                    _ = tokio::time::sleep(sleep_for) => {}
                }
                let idle_ms = (now_millis() - last_active.load(Ordering::Acquire)).max(0) as u64;
                let idle = Duration::from_millis(idle_ms);
                if idle >= max_idle {
                    debug!(address = %address, "entity idle, terminating");
                    Self::terminate_slot(&entities, &structure, &address).await;
                    return;
                }
                sleep_for = max_idle - idle;
            }
        });
    }

    async fn terminate_slot(
        entities: &DashMap<EntityAddress, EntitySlot>,
        structure: &Semaphore,
        address: &EntityAddress,
    ) {
        let Ok(_permit) = structure.acquire().await else {
            return;
        };
        if let Some(mut slot) = entities.get_mut(address) {
            if let EntitySlot::Active(state) = slot.value() {
                let state = Arc::clone(state);
                *slot.value_mut() = EntitySlot::Terminating;
                state.sender.shutdown();
                state.scope.cancel();
            }
        }
    }
}
