use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use parking_lot::Mutex;

use async_trait::async_trait;

use crate::error::ShardingError;
use crate::mailbox_storage::{Entry, MailboxStorage, SaveOutcome};
use crate::message::{MessageState, WireMessage};
use crate::types::{EntityAddress, EntityId, EntityType, ShardId};

/// In-memory mailbox storage for testing and single-process deployments.
///
/// Sequence numbers are dense and strictly increasing per
/// `(entity_type, entity_id)`, starting at 1.
pub struct MemoryMailboxStorage {
    inner: Mutex<Inner>,
    /// Fault injection: when set, `save_message` fails with a
    /// persistence error.
    fail_saves: AtomicBool,
}

struct Inner {
    logs: HashMap<(EntityType, EntityId), EntityLog>,
}

struct EntityLog {
    next_sequence: u64,
    /// Records in save order; primary-key lookup scans, which is fine at
    /// test scale.
    records: Vec<Record>,
}

struct Record {
    entry: Entry,
    state: MessageState,
}

impl MemoryMailboxStorage {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                logs: HashMap::new(),
            }),
            fail_saves: AtomicBool::new(false),
        }
    }

    /// Make subsequent `save_message` calls fail (fault injection).
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::Release);
    }

    /// Number of records persisted for an entity, regardless of state.
    pub fn record_count(&self, address: &EntityAddress) -> usize {
        let inner = self.inner.lock();
        inner
            .logs
            .get(&(address.entity_type.clone(), address.entity_id.clone()))
            .map(|log| log.records.len())
            .unwrap_or(0)
    }
}

impl Default for MemoryMailboxStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MailboxStorage for MemoryMailboxStorage {
    async fn save_message(
        &self,
        address: &EntityAddress,
        message: &WireMessage,
    ) -> Result<SaveOutcome, ShardingError> {
        if self.fail_saves.load(Ordering::Acquire) {
            return Err(ShardingError::MessagePersistenceError {
                reason: "save failure injected".to_string(),
                source: None,
            });
        }

        let mut inner = self.inner.lock();
        let log = inner
            .logs
            .entry((address.entity_type.clone(), address.entity_id.clone()))
            .or_insert_with(|| EntityLog {
                next_sequence: 1,
                records: Vec::new(),
            });

        if let Some(existing) = log
            .records
            .iter()
            .find(|r| r.entry.message.primary_key == message.primary_key)
        {
            return Ok(SaveOutcome::Duplicate {
                state: existing.state.clone(),
            });
        }

        let entry = Entry {
            shard_id: address.shard_id,
            entity_type: address.entity_type.clone(),
            entity_id: address.entity_id.clone(),
            message: message.clone(),
            sequence_number: log.next_sequence,
            saved_at: Utc::now(),
        };
        log.next_sequence += 1;
        log.records.push(Record {
            entry: entry.clone(),
            state: MessageState::Pending,
        });

        Ok(SaveOutcome::Saved(entry))
    }

    async fn update_message(
        &self,
        address: &EntityAddress,
        primary_key: &str,
        state: MessageState,
    ) -> Result<(), ShardingError> {
        let mut inner = self.inner.lock();
        let record = inner
            .logs
            .get_mut(&(address.entity_type.clone(), address.entity_id.clone()))
            .and_then(|log| {
                log.records
                    .iter_mut()
                    .find(|r| r.entry.message.primary_key == primary_key)
            })
            .ok_or_else(|| ShardingError::NoSuchElement {
                reason: format!("no record {primary_key} for {address}"),
            })?;
        record.state = state;
        Ok(())
    }

    async fn message_state(
        &self,
        address: &EntityAddress,
        primary_key: &str,
    ) -> Result<Option<MessageState>, ShardingError> {
        let inner = self.inner.lock();
        Ok(inner
            .logs
            .get(&(address.entity_type.clone(), address.entity_id.clone()))
            .and_then(|log| {
                log.records
                    .iter()
                    .find(|r| r.entry.message.primary_key == primary_key)
            })
            .map(|r| r.state.clone()))
    }

    async fn unprocessed_entries(
        &self,
        shard_ids: &[ShardId],
    ) -> Result<Vec<Entry>, ShardingError> {
        let inner = self.inner.lock();
        let mut entries: Vec<Entry> = inner
            .logs
            .values()
            .flat_map(|log| log.records.iter())
            .filter(|r| {
                matches!(r.state, MessageState::Pending) && shard_ids.contains(&r.entry.shard_id)
            })
            .map(|r| r.entry.clone())
            .collect();
        entries.sort_by(|a, b| {
            (&a.entity_type, &a.entity_id, a.sequence_number).cmp(&(
                &b.entity_type,
                &b.entity_id,
                b.sequence_number,
            ))
        });
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageExit;
    use serde_json::json;

    fn address(id: &str) -> EntityAddress {
        EntityAddress {
            shard_id: crate::hash::shard_for_entity(id, 16),
            entity_type: EntityType::new("Counter"),
            entity_id: EntityId::new(id),
        }
    }

    fn message(key: &str) -> WireMessage {
        WireMessage::new(key, "Inc", json!(null))
    }

    #[tokio::test]
    async fn sequence_numbers_are_dense_per_entity() {
        let storage = MemoryMailboxStorage::new();
        let addr = address("x");
        for expected in 1..=5u64 {
            let outcome = storage
                .save_message(&addr, &message(&format!("k{expected}")))
                .await
                .unwrap();
            match outcome {
                SaveOutcome::Saved(entry) => assert_eq!(entry.sequence_number, expected),
                SaveOutcome::Duplicate { .. } => panic!("unexpected duplicate"),
            }
        }

        // A different entity starts its own sequence.
        let other = address("y");
        match storage.save_message(&other, &message("k1")).await.unwrap() {
            SaveOutcome::Saved(entry) => assert_eq!(entry.sequence_number, 1),
            SaveOutcome::Duplicate { .. } => panic!("unexpected duplicate"),
        }
    }

    #[tokio::test]
    async fn duplicate_primary_key_reports_state() {
        let storage = MemoryMailboxStorage::new();
        let addr = address("x");
        storage.save_message(&addr, &message("k1")).await.unwrap();
        storage
            .update_message(
                &addr,
                "k1",
                MessageState::Processed {
                    exit: MessageExit::succeed(json!(1)),
                },
            )
            .await
            .unwrap();

        match storage.save_message(&addr, &message("k1")).await.unwrap() {
            SaveOutcome::Duplicate { state } => assert!(state.is_terminal()),
            SaveOutcome::Saved(_) => panic!("expected duplicate"),
        }
        assert_eq!(storage.record_count(&addr), 1);
    }

    #[tokio::test]
    async fn update_unknown_message_is_no_such_element() {
        let storage = MemoryMailboxStorage::new();
        let err = storage
            .update_message(&address("x"), "missing", MessageState::Pending)
            .await
            .unwrap_err();
        assert!(matches!(err, ShardingError::NoSuchElement { .. }));
    }

    #[tokio::test]
    async fn unprocessed_entries_filters_by_shard_and_state() {
        let storage = MemoryMailboxStorage::new();
        let addr = address("x");
        storage.save_message(&addr, &message("k1")).await.unwrap();
        storage.save_message(&addr, &message("k2")).await.unwrap();
        storage
            .update_message(
                &addr,
                "k1",
                MessageState::Processed {
                    exit: MessageExit::succeed(json!(null)),
                },
            )
            .await
            .unwrap();

        let pending = storage.unprocessed_entries(&[addr.shard_id]).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].message.primary_key, "k2");

        let other_shard = ShardId::new(addr.shard_id.0 + 1);
        let none = storage.unprocessed_entries(&[other_shard]).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn injected_save_failure() {
        let storage = MemoryMailboxStorage::new();
        storage.set_fail_saves(true);
        let err = storage
            .save_message(&address("x"), &message("k1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ShardingError::MessagePersistenceError { .. }));

        storage.set_fail_saves(false);
        storage
            .save_message(&address("x"), &message("k1"))
            .await
            .unwrap();
    }
}
