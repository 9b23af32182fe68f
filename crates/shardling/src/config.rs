use crate::error::ShardingError;
use crate::types::PodAddress;
use std::time::Duration;

/// Configuration for a pod's sharding runtime.
#[derive(Debug, Clone)]
pub struct ShardingConfig {
    /// Address this pod advertises to the shard manager and other pods.
    pub pod_address: PodAddress,
    /// Cluster-wide shard count. Must match across every pod.
    pub number_of_shards: u32,
    /// Default idle TTL before an entity is terminated. Per-entity
    /// behaviors may override it.
    pub entity_max_idle_time: Duration,
    /// Upper bound on graceful entity termination during shutdown or
    /// shard movement.
    pub entity_termination_timeout: Duration,
    /// How often the background task pulls fresh assignments from the
    /// shard manager. Default: 5s.
    pub refresh_assignments_interval: Duration,
    /// Delay before retrying a failed mailbox offer (shutdown race or a
    /// bounded mailbox rejecting). Default: 100ms.
    pub send_retry_interval: Duration,
    /// How often `Messenger::ask` polls storage for a terminal message
    /// state. Default: 50ms.
    pub ask_poll_interval: Duration,
}

impl ShardingConfig {
    /// Validate configuration values. Component construction fails on the
    /// first invalid field.
    pub fn validate(&self) -> Result<(), ShardingError> {
        if self.number_of_shards == 0 {
            return Err(ShardingError::InvalidConfig {
                reason: "number_of_shards must be >= 1".to_string(),
            });
        }
        if self.entity_termination_timeout.is_zero() {
            return Err(ShardingError::InvalidConfig {
                reason: "entity_termination_timeout must be > 0".to_string(),
            });
        }
        if self.refresh_assignments_interval.is_zero() {
            return Err(ShardingError::InvalidConfig {
                reason: "refresh_assignments_interval must be > 0".to_string(),
            });
        }
        if self.send_retry_interval.is_zero() {
            return Err(ShardingError::InvalidConfig {
                reason: "send_retry_interval must be > 0".to_string(),
            });
        }
        if self.ask_poll_interval.is_zero() {
            return Err(ShardingError::InvalidConfig {
                reason: "ask_poll_interval must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            pod_address: PodAddress::new("127.0.0.1", 54321),
            number_of_shards: 300,
            entity_max_idle_time: Duration::from_secs(60),
            entity_termination_timeout: Duration::from_secs(15),
            refresh_assignments_interval: Duration::from_secs(5),
            send_retry_interval: Duration::from_millis(100),
            ask_poll_interval: Duration::from_millis(50),
        }
    }
}

/// Configuration for the shard manager control plane.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Port the manager advertises for its RPC frontend (the transport
    /// itself is an external collaborator).
    pub port: u16,
    /// Cluster-wide shard count. Must match the pods' value.
    pub number_of_shards: u32,
    /// How often the periodic rebalance pass runs. Default: 20s.
    pub rebalance_interval: Duration,
    /// Delay before retrying entity termination that failed during a
    /// shard move. Default: 10s.
    pub rebalance_retry_interval: Duration,
    /// Fraction of shards that may move in a single rebalance pass, in
    /// `(0, 1]`. Default: 2%.
    pub rebalance_rate: f64,
    /// Delay between assignment-store write retries. Default: 3s.
    pub persist_retry_interval: Duration,
    /// Attempts for an assignment-store write before giving up. Default: 100.
    pub persist_retry_count: u32,
    /// How often every registered pod is probed. Default: 1 minute.
    pub pod_health_check_interval: Duration,
    /// Per-pod ping timeout during the health sweep. Default: 3s.
    pub pod_ping_timeout: Duration,
}

impl ManagerConfig {
    pub fn validate(&self) -> Result<(), ShardingError> {
        if self.number_of_shards == 0 {
            return Err(ShardingError::InvalidConfig {
                reason: "number_of_shards must be >= 1".to_string(),
            });
        }
        if !(self.rebalance_rate > 0.0 && self.rebalance_rate <= 1.0) {
            return Err(ShardingError::InvalidConfig {
                reason: format!(
                    "rebalance_rate must be in (0, 1], got {}",
                    self.rebalance_rate
                ),
            });
        }
        if self.rebalance_interval.is_zero() {
            return Err(ShardingError::InvalidConfig {
                reason: "rebalance_interval must be > 0".to_string(),
            });
        }
        if self.rebalance_retry_interval.is_zero() {
            return Err(ShardingError::InvalidConfig {
                reason: "rebalance_retry_interval must be > 0".to_string(),
            });
        }
        if self.pod_health_check_interval.is_zero() {
            return Err(ShardingError::InvalidConfig {
                reason: "pod_health_check_interval must be > 0".to_string(),
            });
        }
        if self.pod_ping_timeout.is_zero() {
            return Err(ShardingError::InvalidConfig {
                reason: "pod_ping_timeout must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            number_of_shards: 300,
            rebalance_interval: Duration::from_secs(20),
            rebalance_retry_interval: Duration::from_secs(10),
            rebalance_rate: 0.02,
            persist_retry_interval: Duration::from_secs(3),
            persist_retry_count: 100,
            pod_health_check_interval: Duration::from_secs(60),
            pod_ping_timeout: Duration::from_secs(3),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_sharding_config_is_valid() {
        ShardingConfig::default().validate().unwrap();
    }

    #[test]
    fn default_manager_config_is_valid() {
        ManagerConfig::default().validate().unwrap();
    }

    #[test]
    fn custom_config_overrides() {
        let config = ShardingConfig {
            number_of_shards: 16,
            entity_max_idle_time: Duration::from_millis(50),
            ..Default::default()
        };
        assert_eq!(config.number_of_shards, 16);
        // Other fields keep defaults
        assert_eq!(config.send_retry_interval, Duration::from_millis(100));
    }

    #[test]
    fn validate_zero_shards() {
        let config = ShardingConfig {
            number_of_shards: 0,
            ..Default::default()
        };
        let msg = config.validate().unwrap_err().to_string();
        assert!(msg.contains("number_of_shards"), "got: {msg}");
    }

    #[test]
    fn validate_zero_termination_timeout() {
        let config = ShardingConfig {
            entity_termination_timeout: Duration::ZERO,
            ..Default::default()
        };
        let msg = config.validate().unwrap_err().to_string();
        assert!(msg.contains("entity_termination_timeout"), "got: {msg}");
    }

    #[test]
    fn zero_idle_time_is_valid() {
        // maxIdleTime = 0 means immediate termination after the first
        // processed message, which is a legal deployment choice.
        let config = ShardingConfig {
            entity_max_idle_time: Duration::ZERO,
            ..Default::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn validate_rebalance_rate_bounds() {
        for rate in [0.0, -0.5, 1.5] {
            let config = ManagerConfig {
                rebalance_rate: rate,
                ..Default::default()
            };
            let msg = config.validate().unwrap_err().to_string();
            assert!(msg.contains("rebalance_rate"), "got: {msg}");
        }
        let config = ManagerConfig {
            rebalance_rate: 1.0,
            ..Default::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn validate_zero_ping_timeout() {
        let config = ManagerConfig {
            pod_ping_timeout: Duration::ZERO,
            ..Default::default()
        };
        let msg = config.validate().unwrap_err().to_string();
        assert!(msg.contains("pod_ping_timeout"), "got: {msg}");
    }
}
