use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A protocol message addressed to an entity, in its portable encoded form.
///
/// The primary key is unique per message and correlates the persisted
/// mailbox record, the reply state, and the `ask` wait on the caller side.
/// The tag selects an operation within the entity's protocol; the body is
/// whatever the protocol schema defines for that tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "primaryKey")]
    pub primary_key: String,
    pub tag: String,
    pub body: Value,
}

impl WireMessage {
    pub fn new(primary_key: impl Into<String>, tag: impl Into<String>, body: Value) -> Self {
        Self {
            primary_key: primary_key.into(),
            tag: tag.into(),
            body,
        }
    }
}

/// Outcome of processing one message: success value or failure cause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag")]
pub enum MessageExit {
    Success { value: Value },
    Failure { cause: Value },
}

impl MessageExit {
    pub fn succeed(value: Value) -> Self {
        Self::Success { value }
    }

    pub fn fail(cause: Value) -> Self {
        Self::Failure { cause }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Persisted processing state of a mailbox message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag")]
pub enum MessageState {
    Pending,
    Processed { exit: MessageExit },
}

impl MessageState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Processed { .. })
    }
}
