use prometheus::{IntCounter, IntGauge, IntGaugeVec, Opts, Registry};

/// Cluster-level prometheus metrics.
pub struct ClusterMetrics {
    /// Live entity instances, labelled by entity type.
    pub entities: IntGaugeVec,
    /// Pods registered with the shard manager.
    pub pods: IntGauge,
    /// Pods that passed the last health sweep.
    pub pods_healthy: IntGauge,
    /// Shards with an owner in the current assignment map.
    pub shards_assigned: IntGauge,
    /// Shards currently without an owner.
    pub shards_unassigned: IntGauge,
    /// Total rebalance passes that changed at least one assignment.
    pub rebalances: IntCounter,
    /// Total messages durably saved before delivery.
    pub messages_persisted: IntCounter,
}

impl ClusterMetrics {
    /// Create metrics and register them with the given prometheus registry.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let entities = IntGaugeVec::new(
            Opts::new("cluster_entities", "Live entity instances by type"),
            &["entity_type"],
        )?;
        let pods = IntGauge::with_opts(Opts::new(
            "cluster_pods",
            "Pods registered with the shard manager",
        ))?;
        let pods_healthy = IntGauge::with_opts(Opts::new(
            "cluster_pods_healthy",
            "Pods that passed the last health sweep",
        ))?;
        let shards_assigned = IntGauge::with_opts(Opts::new(
            "cluster_shards_assigned",
            "Shards with an owner in the current assignment map",
        ))?;
        let shards_unassigned = IntGauge::with_opts(Opts::new(
            "cluster_shards_unassigned",
            "Shards currently without an owner",
        ))?;
        let rebalances = IntCounter::with_opts(Opts::new(
            "cluster_rebalances_total",
            "Rebalance passes that changed at least one assignment",
        ))?;
        let messages_persisted = IntCounter::with_opts(Opts::new(
            "cluster_messages_persisted_total",
            "Messages durably saved before delivery",
        ))?;

        registry.register(Box::new(entities.clone()))?;
        registry.register(Box::new(pods.clone()))?;
        registry.register(Box::new(pods_healthy.clone()))?;
        registry.register(Box::new(shards_assigned.clone()))?;
        registry.register(Box::new(shards_unassigned.clone()))?;
        registry.register(Box::new(rebalances.clone()))?;
        registry.register(Box::new(messages_persisted.clone()))?;

        Ok(Self {
            entities,
            pods,
            pods_healthy,
            shards_assigned,
            shards_unassigned,
            rebalances,
            messages_persisted,
        })
    }

    /// Create metrics without registering (for testing).
    pub fn unregistered() -> Self {
        Self {
            entities: IntGaugeVec::new(Opts::new("cluster_entities", "entities"), &["entity_type"])
                .expect("valid metric name"),
            pods: IntGauge::new("cluster_pods", "pods").expect("valid metric name"),
            pods_healthy: IntGauge::new("cluster_pods_healthy", "healthy")
                .expect("valid metric name"),
            shards_assigned: IntGauge::new("cluster_shards_assigned", "assigned")
                .expect("valid metric name"),
            shards_unassigned: IntGauge::new("cluster_shards_unassigned", "unassigned")
                .expect("valid metric name"),
            rebalances: IntCounter::new("cluster_rebalances_total", "rebalances")
                .expect("valid metric name"),
            messages_persisted: IntCounter::new("cluster_messages_persisted_total", "persisted")
                .expect("valid metric name"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_metrics_work() {
        let m = ClusterMetrics::unregistered();
        m.entities.with_label_values(&["Counter"]).set(5);
        assert_eq!(m.entities.with_label_values(&["Counter"]).get(), 5);
        m.rebalances.inc();
        assert_eq!(m.rebalances.get(), 1);
    }

    #[test]
    fn registered_metrics_work() {
        let r = Registry::new();
        let m = ClusterMetrics::new(&r).unwrap();
        m.shards_assigned.set(10);
        assert_eq!(m.shards_assigned.get(), 10);
    }
}
