use async_trait::async_trait;
use serde_json::Value;

use crate::error::ShardingError;
use crate::events::ShardingEvent;
use crate::types::PodAddress;

/// Pod-to-pod transport client.
///
/// Implementations may batch internally but must preserve per-destination
/// ordering of `send` calls issued by a single caller task. Any operation
/// may fail with [`ShardingError::PodUnavailable`]; the sharding runtime
/// reacts by flagging the pod to the shard manager.
#[async_trait]
pub trait Pods: Send + Sync {
    /// Deliver an encoded envelope to the addressed pod's local entity
    /// manager.
    async fn send(&self, pod: &PodAddress, envelope: &Value) -> Result<(), ShardingError>;

    /// Liveness probe.
    async fn ping(&self, pod: &PodAddress) -> Result<(), ShardingError>;

    /// Push a cluster event to a pod (e.g. instructing it to terminate
    /// entities on shards it no longer owns).
    async fn notify(&self, pod: &PodAddress, event: &ShardingEvent) -> Result<(), ShardingError>;
}
