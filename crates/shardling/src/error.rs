use crate::types::{EntityAddress, PodAddress};

/// Errors surfaced by the sharding runtime.
#[derive(Debug, thiserror::Error)]
pub enum ShardingError {
    /// The target entity is not owned by this pod, the pod is shutting
    /// down, or the envelope's address could not be decoded. Callers may
    /// refresh their assignment cache and retry.
    #[error("entity not managed by this pod: {}", .address.as_ref().map(ToString::to_string).unwrap_or_else(|| String::from("<undecodable address>")))]
    EntityNotManagedByPod { address: Option<EntityAddress> },

    /// The envelope's message payload failed to decode. Never retried.
    #[error("malformed message: {reason}")]
    MalformedMessage {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The durable mailbox store failed while persisting or updating a
    /// message.
    #[error("message persistence error: {reason}")]
    MessagePersistenceError {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A storage lookup found nothing. Treated as absence, not failure:
    /// the specific in-flight operation is dropped.
    #[error("no such element: {reason}")]
    NoSuchElement { reason: String },

    /// A peer pod did not respond. Surfacing this triggers an unhealthy-pod
    /// notification to the shard manager.
    #[error("pod unavailable: {address}")]
    PodUnavailable {
        address: PodAddress,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl ShardingError {
    /// Shorthand for the routing failure with a known address.
    pub fn not_managed(address: EntityAddress) -> Self {
        Self::EntityNotManagedByPod {
            address: Some(address),
        }
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedMessage {
            reason: reason.into(),
            source: None,
        }
    }
}
