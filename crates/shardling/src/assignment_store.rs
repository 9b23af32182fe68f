use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::ShardingError;
use crate::types::{PodAddress, ShardId};

/// The cluster-wide shard ownership map.
///
/// `None` marks a shard with no owner, a transient state during
/// rebalancing or before the first pod registers.
pub type AssignmentMap = HashMap<ShardId, Option<PodAddress>>;

/// Persistence backend for the shard manager's computed assignments.
#[async_trait]
pub trait AssignmentStore: Send + Sync {
    /// Read the last persisted map. An empty map if nothing was written.
    async fn read(&self) -> Result<AssignmentMap, ShardingError>;

    /// Atomically replace the persisted map.
    async fn write(&self, assignments: &AssignmentMap) -> Result<(), ShardingError>;
}
