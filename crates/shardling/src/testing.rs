//! In-process test cluster for unit and integration testing.
//!
//! Wires any number of pod runtimes and a shard manager together with an
//! in-memory transport, shared in-memory mailbox storage, and an
//! in-memory assignment store. No sockets are involved; "crashing" a pod
//! just detaches it from the transport.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serde_json::Value;

use crate::config::{ManagerConfig, ShardingConfig};
use crate::entity::EntityBehavior;
use crate::error::ShardingError;
use crate::events::ShardingEvent;
use crate::metrics::ClusterMetrics;
use crate::pods::Pods;
use crate::pods_health::PingPodsHealth;
use crate::shard_manager::ShardManager;
use crate::shard_manager_client::ShardManagerClient;
use crate::sharding::Sharding;
use crate::storage::memory_assignment::MemoryAssignmentStore;
use crate::storage::memory_mailbox::MemoryMailboxStorage;
use crate::types::PodAddress;

/// In-memory transport routing envelopes straight into attached pod
/// runtimes. Detached or downed pods behave like unreachable hosts.
pub struct WiredPods {
    attached: DashMap<PodAddress, Arc<Sharding>>,
    down: DashSet<PodAddress>,
}

impl WiredPods {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            attached: DashMap::new(),
            down: DashSet::new(),
        })
    }

    pub fn attach(&self, sharding: Arc<Sharding>) {
        self.attached
            .insert(sharding.local_address().clone(), sharding);
    }

    /// Simulate a crash: the pod stops answering without unregistering.
    pub fn detach(&self, pod: &PodAddress) {
        self.attached.remove(pod);
    }

    /// Toggle reachability without dropping the runtime.
    pub fn set_down(&self, pod: &PodAddress, down: bool) {
        if down {
            self.down.insert(pod.clone());
        } else {
            self.down.remove(pod);
        }
    }

    fn target(&self, pod: &PodAddress) -> Result<Arc<Sharding>, ShardingError> {
        if self.down.contains(pod) {
            return Err(ShardingError::PodUnavailable {
                address: pod.clone(),
                source: None,
            });
        }
        self.attached
            .get(pod)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| ShardingError::PodUnavailable {
                address: pod.clone(),
                source: None,
            })
    }
}

#[async_trait]
impl Pods for WiredPods {
    async fn send(&self, pod: &PodAddress, envelope: &Value) -> Result<(), ShardingError> {
        self.target(pod)?
            .send_to_local_entity_manager(envelope)
            .await
    }

    async fn ping(&self, pod: &PodAddress) -> Result<(), ShardingError> {
        self.target(pod).map(|_| ())
    }

    async fn notify(&self, pod: &PodAddress, event: &ShardingEvent) -> Result<(), ShardingError> {
        let target = self.target(pod)?;
        target.handle_sharding_event(event.clone()).await;
        Ok(())
    }
}

/// A multi-pod in-memory cluster with one shard manager.
pub struct TestCluster {
    manager: Arc<ShardManager>,
    wired: Arc<WiredPods>,
    storage: Arc<MemoryMailboxStorage>,
    pods: Vec<Arc<Sharding>>,
}

impl TestCluster {
    /// Start a cluster of `num_pods` pods over `number_of_shards` shards
    /// with test-friendly timings (fast retries, full-rate rebalance).
    pub async fn start(num_pods: usize, number_of_shards: u32) -> Result<Self, ShardingError> {
        Self::start_with_manager_config(
            num_pods,
            ManagerConfig {
                number_of_shards,
                rebalance_rate: 1.0,
                pod_ping_timeout: Duration::from_millis(200),
                rebalance_retry_interval: Duration::from_millis(100),
                persist_retry_interval: Duration::from_millis(10),
                ..Default::default()
            },
        )
        .await
    }

    /// Start with an explicit manager configuration.
    pub async fn start_with_manager_config(
        num_pods: usize,
        manager_config: ManagerConfig,
    ) -> Result<Self, ShardingError> {
        let number_of_shards = manager_config.number_of_shards;
        let wired = WiredPods::new();
        let storage = Arc::new(MemoryMailboxStorage::new());
        let metrics = Arc::new(ClusterMetrics::unregistered());

        let health = Arc::new(PingPodsHealth::new(
            Arc::clone(&wired) as Arc<dyn Pods>,
            manager_config.pod_ping_timeout,
        ));
        let manager = ShardManager::new(
            manager_config,
            Arc::new(MemoryAssignmentStore::new()),
            Arc::clone(&wired) as Arc<dyn Pods>,
            health,
            Arc::clone(&metrics),
        )?;
        manager.start().await?;

        let mut pods = Vec::with_capacity(num_pods);
        for i in 0..num_pods {
            let config = ShardingConfig {
                pod_address: PodAddress::new("127.0.0.1", 9001 + i as u16),
                number_of_shards,
                refresh_assignments_interval: Duration::from_millis(50),
                send_retry_interval: Duration::from_millis(10),
                ask_poll_interval: Duration::from_millis(5),
                entity_termination_timeout: Duration::from_millis(500),
                ..Default::default()
            };
            let sharding = Sharding::new(
                config,
                Arc::clone(&storage) as Arc<dyn crate::mailbox_storage::MailboxStorage>,
                Arc::clone(&wired) as Arc<dyn Pods>,
                Arc::clone(&manager) as Arc<dyn ShardManagerClient>,
                Arc::clone(&metrics),
            )?;
            wired.attach(Arc::clone(&sharding));
            sharding.start().await?;
            pods.push(sharding);
        }
        // Registration order skews the first snapshots; settle everyone.
        let cluster = Self {
            manager,
            wired,
            storage,
            pods,
        };
        cluster.refresh_all().await;
        Ok(cluster)
    }

    pub fn manager(&self) -> &Arc<ShardManager> {
        &self.manager
    }

    pub fn wired(&self) -> &Arc<WiredPods> {
        &self.wired
    }

    pub fn mailbox_storage(&self) -> &Arc<MemoryMailboxStorage> {
        &self.storage
    }

    pub fn pod(&self, index: usize) -> &Arc<Sharding> {
        &self.pods[index]
    }

    pub fn pod_count(&self) -> usize {
        self.pods.len()
    }

    /// Register the behavior produced by `factory` on every pod.
    pub async fn register_everywhere<F>(&self, factory: F) -> Result<(), ShardingError>
    where
        F: Fn() -> Arc<dyn EntityBehavior>,
    {
        for pod in &self.pods {
            pod.register_entity(factory()).await?;
        }
        Ok(())
    }

    /// Force every pod to pull the latest assignments.
    pub async fn refresh_all(&self) {
        for pod in &self.pods {
            pod.refresh_assignments().await;
        }
    }

    /// Simulate a pod crash: detach it from the transport so pings and
    /// sends fail. The runtime object stays alive but unreachable.
    pub fn crash_pod(&self, index: usize) {
        self.wired.detach(self.pods[index].local_address());
    }

    /// Gracefully stop every pod and the manager.
    pub async fn shutdown(&self) {
        for pod in &self.pods {
            pod.shutdown().await;
        }
        self.manager.shutdown();
    }
}
