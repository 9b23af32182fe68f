use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one bucket of the keyspace, in `[0, number_of_shards)`.
///
/// Derived from an [`EntityId`](super::EntityId) by the stable hash in
/// [`crate::hash`]; all pods compute identical values for the same id.
#[derive(
    Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize,
)]
pub struct ShardId(pub u32);

impl ShardId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
