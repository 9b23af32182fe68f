use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::types::{PodAddress, ShardId};

/// Cluster events published by the shard manager.
///
/// Shard sets use ordered collections so event payloads are stable for
/// logging and assertions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardingEvent {
    ShardsAssigned {
        pod: PodAddress,
        shards: BTreeSet<ShardId>,
    },
    ShardsUnassigned {
        pod: PodAddress,
        shards: BTreeSet<ShardId>,
    },
    PodRegistered {
        pod: PodAddress,
    },
    PodUnregistered {
        pod: PodAddress,
    },
    PodHealthChecked {
        pod: PodAddress,
    },
}

impl ShardingEvent {
    /// The pod this event concerns.
    pub fn pod(&self) -> &PodAddress {
        match self {
            Self::ShardsAssigned { pod, .. }
            | Self::ShardsUnassigned { pod, .. }
            | Self::PodRegistered { pod }
            | Self::PodUnregistered { pod }
            | Self::PodHealthChecked { pod } => pod,
        }
    }
}
