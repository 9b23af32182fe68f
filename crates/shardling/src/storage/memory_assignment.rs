use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use async_trait::async_trait;

use crate::assignment_store::{AssignmentMap, AssignmentStore};
use crate::error::ShardingError;

/// In-memory assignment store for testing and single-process deployments.
pub struct MemoryAssignmentStore {
    assignments: Mutex<AssignmentMap>,
    /// Fault injection: number of upcoming writes that should fail.
    fail_writes: AtomicU32,
}

impl MemoryAssignmentStore {
    pub fn new() -> Self {
        Self {
            assignments: Mutex::new(AssignmentMap::new()),
            fail_writes: AtomicU32::new(0),
        }
    }

    /// Make the next `n` writes fail (fault injection for retry paths).
    pub fn fail_next_writes(&self, n: u32) {
        self.fail_writes.store(n, Ordering::Release);
    }
}

impl Default for MemoryAssignmentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AssignmentStore for MemoryAssignmentStore {
    async fn read(&self) -> Result<AssignmentMap, ShardingError> {
        Ok(self.assignments.lock().clone())
    }

    async fn write(&self, assignments: &AssignmentMap) -> Result<(), ShardingError> {
        let remaining = self.fail_writes.load(Ordering::Acquire);
        if remaining > 0 {
            self.fail_writes.store(remaining - 1, Ordering::Release);
            return Err(ShardingError::MessagePersistenceError {
                reason: "write failure injected".to_string(),
                source: None,
            });
        }
        *self.assignments.lock() = assignments.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PodAddress, ShardId};

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let store = MemoryAssignmentStore::new();
        let mut map = AssignmentMap::new();
        map.insert(ShardId::new(0), Some(PodAddress::new("a", 1)));
        map.insert(ShardId::new(1), None);

        store.write(&map).await.unwrap();
        assert_eq!(store.read().await.unwrap(), map);
    }

    #[tokio::test]
    async fn empty_store_reads_empty_map() {
        let store = MemoryAssignmentStore::new();
        assert!(store.read().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let store = MemoryAssignmentStore::new();
        store.fail_next_writes(2);
        let map = AssignmentMap::new();
        assert!(store.write(&map).await.is_err());
        assert!(store.write(&map).await.is_err());
        assert!(store.write(&map).await.is_ok());
    }
}
