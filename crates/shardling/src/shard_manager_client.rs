use async_trait::async_trait;

use crate::assignment_store::AssignmentMap;
use crate::error::ShardingError;
use crate::types::{PodAddress, ShardId};

/// A pod's handle to the shard manager control plane.
///
/// Deployments back this with an RPC client; single-pod deployments use
/// [`LocalShardManagerClient`]; tests talk to an in-process
/// [`ShardManager`](crate::shard_manager::ShardManager) directly.
#[async_trait]
pub trait ShardManagerClient: Send + Sync {
    async fn register(&self, pod: PodAddress) -> Result<(), ShardingError>;

    async fn unregister(&self, pod: PodAddress) -> Result<(), ShardingError>;

    /// Report a pod that failed to respond. The manager validates the
    /// claim against its own health probe before evicting.
    async fn notify_unhealthy_pod(&self, pod: PodAddress) -> Result<(), ShardingError>;

    /// Snapshot of the current shard ownership map.
    async fn get_assignments(&self) -> Result<AssignmentMap, ShardingError>;
}

/// Degenerate client for single-pod deployments: every shard is owned by
/// the sole local pod and registration is a no-op.
pub struct LocalShardManagerClient {
    pod_address: PodAddress,
    number_of_shards: u32,
}

impl LocalShardManagerClient {
    pub fn new(pod_address: PodAddress, number_of_shards: u32) -> Self {
        Self {
            pod_address,
            number_of_shards,
        }
    }
}

#[async_trait]
impl ShardManagerClient for LocalShardManagerClient {
    async fn register(&self, _pod: PodAddress) -> Result<(), ShardingError> {
        Ok(())
    }

    async fn unregister(&self, _pod: PodAddress) -> Result<(), ShardingError> {
        Ok(())
    }

    async fn notify_unhealthy_pod(&self, pod: PodAddress) -> Result<(), ShardingError> {
        tracing::warn!(pod = %pod, "unhealthy pod reported to local shard manager client");
        Ok(())
    }

    async fn get_assignments(&self) -> Result<AssignmentMap, ShardingError> {
        Ok((0..self.number_of_shards)
            .map(|id| (ShardId::new(id), Some(self.pod_address.clone())))
            .collect())
    }
}
