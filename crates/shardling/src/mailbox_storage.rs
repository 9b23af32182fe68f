use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::ShardingError;
use crate::message::{MessageState, WireMessage};
use crate::types::{EntityAddress, EntityId, EntityType, ShardId};

/// A durably persisted mailbox record.
///
/// `sequence_number` is dense and strictly increasing per
/// `(entity_type, entity_id)`, assigned by the store at save time.
#[derive(Debug, Clone)]
pub struct Entry {
    pub shard_id: ShardId,
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub message: WireMessage,
    pub sequence_number: u64,
    pub saved_at: DateTime<Utc>,
}

impl Entry {
    pub fn address(&self) -> EntityAddress {
        EntityAddress {
            shard_id: self.shard_id,
            entity_type: self.entity_type.clone(),
            entity_id: self.entity_id.clone(),
        }
    }
}

/// Result of saving a message to storage.
#[derive(Debug, Clone)]
pub enum SaveOutcome {
    /// Message saved with a freshly assigned sequence number.
    Saved(Entry),
    /// A record with the same primary key already exists for this entity.
    /// The current state is returned so callers can short-circuit.
    Duplicate { state: MessageState },
}

/// Durable log of messages per entity, plus processing-state updates.
///
/// The save must be atomic per call and must complete before the in-memory
/// mailbox offer, so that a crash between the two can be repaired by
/// replaying the still-pending entries.
#[async_trait]
pub trait MailboxStorage: Send + Sync {
    /// Append a message for the addressed entity. Assigns the next
    /// sequence number and persists the record in `Pending` state.
    async fn save_message(
        &self,
        address: &EntityAddress,
        message: &WireMessage,
    ) -> Result<SaveOutcome, ShardingError>;

    /// Set the processing state of a previously saved message. Idempotent
    /// under repeated application of the same terminal state.
    async fn update_message(
        &self,
        address: &EntityAddress,
        primary_key: &str,
        state: MessageState,
    ) -> Result<(), ShardingError>;

    /// Read the current state of a message, `None` if it was never saved.
    async fn message_state(
        &self,
        address: &EntityAddress,
        primary_key: &str,
    ) -> Result<Option<MessageState>, ShardingError>;

    /// All still-`Pending` entries for the given shards, ordered by
    /// sequence number within each entity. Used to replay after a pod
    /// acquires shards.
    async fn unprocessed_entries(
        &self,
        shard_ids: &[ShardId],
    ) -> Result<Vec<Entry>, ShardingError>;
}
