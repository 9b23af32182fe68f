use async_trait::async_trait;

use crate::error::ShardingError;
use crate::pods_health::PodsHealth;
use crate::types::PodAddress;

/// No-op health check that always reports alive.
pub struct NoopPodsHealth;

#[async_trait]
impl PodsHealth for NoopPodsHealth {
    async fn is_alive(&self, _address: &PodAddress) -> Result<bool, ShardingError> {
        Ok(true)
    }
}
