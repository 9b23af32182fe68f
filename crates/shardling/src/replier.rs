use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

use crate::error::ShardingError;
use crate::mailbox_storage::MailboxStorage;
use crate::message::{MessageExit, MessageState};
use crate::types::EntityAddress;

/// Capability handed to an entity behavior for completing one message.
///
/// Each completion writes the terminal `Processed` state to the mailbox
/// store and only then refreshes the entity's last-active time, so idle
/// expiration counts processed work, not enqueued work. The manager never
/// infers completion: a message without a reply stays `Pending` and may be
/// redelivered on recovery.
#[derive(Clone)]
pub struct Replier {
    address: EntityAddress,
    primary_key: String,
    storage: Arc<dyn MailboxStorage>,
    last_active_ms: Arc<AtomicI64>,
    /// Entity-wide count of accepted-but-uncompleted messages, shared
    /// with the entity manager's drain logic.
    in_flight: Arc<AtomicUsize>,
    /// First completion wins the in-flight decrement; repeats only
    /// re-write the (idempotent) terminal state.
    completed: Arc<AtomicBool>,
}

impl std::fmt::Debug for Replier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replier")
            .field("address", &self.address)
            .field("primary_key", &self.primary_key)
            .finish()
    }
}

impl Replier {
    pub(crate) fn new(
        address: EntityAddress,
        primary_key: String,
        storage: Arc<dyn MailboxStorage>,
        last_active_ms: Arc<AtomicI64>,
        in_flight: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            address,
            primary_key,
            storage,
            last_active_ms,
            in_flight,
            completed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Address of the entity this replier is bound to.
    pub fn address(&self) -> &EntityAddress {
        &self.address
    }

    /// Primary key of the message this replier completes.
    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    pub async fn succeed(&self, value: Value) -> Result<(), ShardingError> {
        self.complete(MessageExit::succeed(value)).await
    }

    pub async fn fail(&self, cause: Value) -> Result<(), ShardingError> {
        self.complete(MessageExit::fail(cause)).await
    }

    /// Fail with a human-readable cause.
    pub async fn fail_cause(&self, cause: impl std::fmt::Display) -> Result<(), ShardingError> {
        self.complete(MessageExit::fail(Value::String(cause.to_string())))
            .await
    }

    /// Write the terminal exit for this message, then refresh the entity's
    /// last-active time (in that order).
    pub async fn complete(&self, exit: MessageExit) -> Result<(), ShardingError> {
        self.storage
            .update_message(
                &self.address,
                &self.primary_key,
                MessageState::Processed { exit },
            )
            .await?;
        self.touch();
        if !self.completed.swap(true, Ordering::AcqRel) {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Run an effect and complete with its outcome.
    pub async fn complete_effect<F>(&self, effect: F) -> Result<(), ShardingError>
    where
        F: Future<Output = Result<Value, Value>> + Send,
    {
        match effect.await {
            Ok(value) => self.succeed(value).await,
            Err(cause) => self.fail(cause).await,
        }
    }

    fn touch(&self) {
        self.last_active_ms.store(now_millis(), Ordering::Release);
    }
}

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
