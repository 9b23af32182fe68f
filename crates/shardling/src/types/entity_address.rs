use super::{EntityId, EntityType, ShardId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Full address of an entity instance: shard + type + id.
///
/// Invariant: `shard_id` equals the hash of `entity_id` modulo the
/// cluster-wide shard count. Addresses built through
/// [`EntityAddress::for_entity`] always satisfy it; addresses decoded off
/// the wire are re-checked before dispatch.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct EntityAddress {
    #[serde(rename = "shardId")]
    pub shard_id: ShardId,
    #[serde(rename = "entityType")]
    pub entity_type: EntityType,
    #[serde(rename = "entityId")]
    pub entity_id: EntityId,
}

impl EntityAddress {
    /// Derive the address for an entity id under the given shard count.
    pub fn for_entity(entity_type: EntityType, entity_id: EntityId, number_of_shards: u32) -> Self {
        let shard_id = crate::hash::shard_for_entity(entity_id.as_ref(), number_of_shards);
        Self {
            shard_id,
            entity_type,
            entity_id,
        }
    }
}

impl fmt::Display for EntityAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.shard_id, self.entity_type, self.entity_id
        )
    }
}
