mod entity_address;
mod entity_id;
mod entity_type;
mod pod_address;
mod shard_id;

pub use entity_address::EntityAddress;
pub use entity_id::EntityId;
pub use entity_type::EntityType;
pub use pod_address::PodAddress;
pub use shard_id::ShardId;
