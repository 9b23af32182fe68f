use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::ShardingError;
use crate::mailbox::Mailbox;
use crate::message::WireMessage;
use crate::replier::Replier;
use crate::types::{EntityAddress, EntityType, PodAddress};

/// Per-registration tuning for an entity type, passed alongside the
/// behavior when it is registered.
///
/// A value set here wins over the behavior's own default
/// ([`EntityBehavior::max_idle_time`]), which in turn wins over the
/// pod-wide configuration.
#[derive(Debug, Clone, Default)]
pub struct RecipientOptions {
    /// Idle TTL before instances of this registration are terminated.
    pub max_idle_time: Option<Duration>,
}

impl RecipientOptions {
    pub fn with_max_idle_time(max_idle_time: Duration) -> Self {
        Self {
            max_idle_time: Some(max_idle_time),
        }
    }
}

/// Context handed to an entity behavior when its instance starts.
#[derive(Clone)]
pub struct EntityContext {
    /// The address of this entity instance.
    pub address: EntityAddress,
    /// The address of the pod hosting this entity.
    pub pod_address: PodAddress,
    /// Cancelled when the entity's scope closes (idle expiration, shard
    /// movement, or pod shutdown).
    pub scope: CancellationToken,
}

/// One delivered mailbox item: the decoded message plus the capability to
/// complete it.
#[derive(Debug)]
pub struct EntityMessage {
    pub message: WireMessage,
    /// Storage-assigned position in the entity's durable log.
    pub sequence_number: u64,
    pub replier: Replier,
}

/// User-defined behavior for one entity type.
///
/// `run` is started in a fresh child scope the first time a message
/// arrives for an entity id, receives messages through the mailbox in
/// persisted order, and must complete each one through its
/// [`Replier`]. Returning (or failing) closes the entity's scope; the
/// entity is recreated on the next message.
#[async_trait]
pub trait EntityBehavior: Send + Sync + 'static {
    /// Stable name of this entity type.
    fn entity_type(&self) -> EntityType;

    /// Idle TTL before the instance is terminated. `None` = use the
    /// pod-wide default. Overridden per registration by
    /// [`RecipientOptions::max_idle_time`].
    fn max_idle_time(&self) -> Option<Duration> {
        None
    }

    /// Process messages until the mailbox drains or the scope closes.
    async fn run(
        &self,
        ctx: EntityContext,
        mailbox: Mailbox<EntityMessage>,
    ) -> Result<(), ShardingError>;
}
