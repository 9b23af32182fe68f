use async_trait::async_trait;
use serde_json::Value;

use crate::error::ShardingError;
use crate::events::ShardingEvent;
use crate::pods::Pods;
use crate::types::PodAddress;

/// No-op transport that reports every pod as unavailable.
/// Used for single-pod / test scenarios where no remote pods exist.
pub struct NoopPods;

#[async_trait]
impl Pods for NoopPods {
    async fn send(&self, pod: &PodAddress, _envelope: &Value) -> Result<(), ShardingError> {
        Err(ShardingError::PodUnavailable {
            address: pod.clone(),
            source: None,
        })
    }

    async fn ping(&self, pod: &PodAddress) -> Result<(), ShardingError> {
        Err(ShardingError::PodUnavailable {
            address: pod.clone(),
            source: None,
        })
    }

    async fn notify(&self, pod: &PodAddress, _event: &ShardingEvent) -> Result<(), ShardingError> {
        Err(ShardingError::PodUnavailable {
            address: pod.clone(),
            source: None,
        })
    }
}
