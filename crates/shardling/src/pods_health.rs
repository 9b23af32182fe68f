use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ShardingError;
use crate::pods::Pods;
use crate::types::PodAddress;

/// Liveness oracle consulted before evicting a pod.
#[async_trait]
pub trait PodsHealth: Send + Sync {
    async fn is_alive(&self, address: &PodAddress) -> Result<bool, ShardingError>;
}

/// Health check backed by the transport's ping, bounded by a timeout.
pub struct PingPodsHealth {
    pods: Arc<dyn Pods>,
    timeout: Duration,
}

impl PingPodsHealth {
    pub fn new(pods: Arc<dyn Pods>, timeout: Duration) -> Self {
        Self { pods, timeout }
    }
}

#[async_trait]
impl PodsHealth for PingPodsHealth {
    async fn is_alive(&self, address: &PodAddress) -> Result<bool, ShardingError> {
        match tokio::time::timeout(self.timeout, self.pods.ping(address)).await {
            Ok(Ok(())) => Ok(true),
            Ok(Err(_)) | Err(_) => Ok(false),
        }
    }
}
