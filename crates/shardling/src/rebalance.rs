use std::collections::{BTreeMap, BTreeSet};

use crate::assignment_store::AssignmentMap;
use crate::types::{PodAddress, ShardId};

/// One planned ownership transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardMove {
    pub shard: ShardId,
    pub from: PodAddress,
    pub to: PodAddress,
}

/// Output of a rebalance pass computation.
#[derive(Debug, Default)]
pub struct RebalancePlan {
    /// Destinations for shards that currently have no live owner. These
    /// placements are never rate-bounded: an unowned shard serves nobody.
    pub assign_unowned: BTreeMap<ShardId, PodAddress>,
    /// Transfers from overloaded to underloaded pods, at most
    /// `ceil(rebalance_rate * number_of_shards)` per pass. Remaining
    /// imbalance is picked up by the next pass.
    pub moves: Vec<ShardMove>,
}

impl RebalancePlan {
    pub fn is_empty(&self) -> bool {
        self.assign_unowned.is_empty() && self.moves.is_empty()
    }
}

/// Per-pod shard quota: `floor(N / pods)` each, with the remainder handed
/// out one-by-one in sorted pod-address order so every pod computes the
/// same answer.
pub fn target_counts(
    pods: &BTreeSet<PodAddress>,
    number_of_shards: u32,
) -> BTreeMap<PodAddress, u32> {
    let mut targets = BTreeMap::new();
    if pods.is_empty() {
        return targets;
    }
    let base = number_of_shards / pods.len() as u32;
    let remainder = number_of_shards as usize % pods.len();
    for (i, pod) in pods.iter().enumerate() {
        let extra = if i < remainder { 1 } else { 0 };
        targets.insert(pod.clone(), base + extra);
    }
    targets
}

/// Compute a movement plan that balances shard counts across the live
/// pods while minimizing movement.
///
/// Shards assigned to pods outside `pods` are treated as unowned. Moves
/// drain each overloaded pod's numerically smallest excess shards into
/// the least-loaded underloaded pod, ties broken by pod-address order.
pub fn plan_rebalance(
    assignments: &AssignmentMap,
    pods: &BTreeSet<PodAddress>,
    number_of_shards: u32,
    rebalance_rate: f64,
) -> RebalancePlan {
    let mut plan = RebalancePlan::default();
    if pods.is_empty() {
        return plan;
    }

    let targets = target_counts(pods, number_of_shards);

    let mut owned: BTreeMap<&PodAddress, BTreeSet<ShardId>> =
        pods.iter().map(|p| (p, BTreeSet::new())).collect();
    let mut unowned: BTreeSet<ShardId> = BTreeSet::new();
    for id in 0..number_of_shards {
        let shard = ShardId::new(id);
        match assignments.get(&shard) {
            Some(Some(pod)) if owned.contains_key(pod) => {
                if let Some(set) = owned.get_mut(pod) {
                    set.insert(shard);
                }
            }
            _ => {
                unowned.insert(shard);
            }
        }
    }

    let mut counts: BTreeMap<&PodAddress, u32> = owned
        .iter()
        .map(|(pod, shards)| (*pod, shards.len() as u32))
        .collect();

    for shard in unowned {
        let dest = least_loaded(&counts, |_| true);
        if let Some(dest) = dest {
            plan.assign_unowned.insert(shard, dest.clone());
            counts.entry(dest).and_modify(|c| *c += 1);
        }
    }

    let max_moves = (rebalance_rate * number_of_shards as f64).ceil() as usize;
    'drain: for (pod, shards) in &owned {
        let target = targets[*pod];
        for shard in shards {
            if counts[*pod] <= target {
                break;
            }
            let Some(dest) = least_loaded(&counts, |p| counts[p] < targets[p]) else {
                break 'drain;
            };
            counts.entry(*pod).and_modify(|c| *c -= 1);
            counts.entry(dest).and_modify(|c| *c += 1);
            plan.moves.push(ShardMove {
                shard: *shard,
                from: (*pod).clone(),
                to: dest.clone(),
            });
            if plan.moves.len() >= max_moves {
                break 'drain;
            }
        }
    }

    plan
}

/// Least-loaded pod among those satisfying the filter. The map iterates
/// in address order, so ties resolve to the smallest address.
fn least_loaded<'a>(
    counts: &BTreeMap<&'a PodAddress, u32>,
    filter: impl Fn(&PodAddress) -> bool,
) -> Option<&'a PodAddress> {
    let mut best: Option<(&'a PodAddress, u32)> = None;
    for (&pod, &count) in counts {
        if !filter(pod) {
            continue;
        }
        match best {
            Some((_, best_count)) if best_count <= count => {}
            _ => best = Some((pod, count)),
        }
    }
    best.map(|(pod, _)| pod)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod(n: u8) -> PodAddress {
        PodAddress::new(format!("10.0.0.{n}"), 8080)
    }

    fn pods(ns: &[u8]) -> BTreeSet<PodAddress> {
        ns.iter().map(|&n| pod(n)).collect()
    }

    fn assignments_for(plan: &RebalancePlan, base: &AssignmentMap) -> AssignmentMap {
        let mut map = base.clone();
        for (shard, dest) in &plan.assign_unowned {
            map.insert(*shard, Some(dest.clone()));
        }
        for mv in &plan.moves {
            map.insert(mv.shard, Some(mv.to.clone()));
        }
        map
    }

    fn counts(map: &AssignmentMap) -> BTreeMap<PodAddress, usize> {
        let mut counts = BTreeMap::new();
        for owner in map.values().flatten() {
            *counts.entry(owner.clone()).or_insert(0) += 1;
        }
        counts
    }

    #[test]
    fn targets_distribute_remainder_deterministically() {
        let targets = target_counts(&pods(&[1, 2, 3]), 10);
        assert_eq!(targets[&pod(1)], 4);
        assert_eq!(targets[&pod(2)], 3);
        assert_eq!(targets[&pod(3)], 3);
        assert_eq!(targets.values().sum::<u32>(), 10);
    }

    #[test]
    fn empty_pod_set_plans_nothing() {
        let plan = plan_rebalance(&AssignmentMap::new(), &BTreeSet::new(), 16, 1.0);
        assert!(plan.is_empty());
    }

    #[test]
    fn single_pod_gets_every_shard() {
        let plan = plan_rebalance(&AssignmentMap::new(), &pods(&[1]), 16, 1.0);
        assert_eq!(plan.assign_unowned.len(), 16);
        assert!(plan.moves.is_empty());
        assert!(plan.assign_unowned.values().all(|p| *p == pod(1)));
    }

    #[test]
    fn fresh_cluster_splits_evenly() {
        let plan = plan_rebalance(&AssignmentMap::new(), &pods(&[1, 2, 3]), 12, 1.0);
        let map = assignments_for(&plan, &AssignmentMap::new());
        let counts = counts(&map);
        assert_eq!(counts[&pod(1)], 4);
        assert_eq!(counts[&pod(2)], 4);
        assert_eq!(counts[&pod(3)], 4);
    }

    #[test]
    fn balanced_cluster_needs_no_moves() {
        let mut map = AssignmentMap::new();
        for id in 0..12 {
            let owner = pod((id % 3 + 1) as u8);
            map.insert(ShardId::new(id), Some(owner));
        }
        let plan = plan_rebalance(&map, &pods(&[1, 2, 3]), 12, 1.0);
        assert!(plan.is_empty());
    }

    #[test]
    fn new_pod_draws_from_overloaded_peers() {
        let mut map = AssignmentMap::new();
        for id in 0..12 {
            let owner = pod((id % 2 + 1) as u8);
            map.insert(ShardId::new(id), Some(owner));
        }
        let plan = plan_rebalance(&map, &pods(&[1, 2, 3]), 12, 1.0);
        assert!(plan.assign_unowned.is_empty());
        // Both incumbents shed down to 4; everything lands on the new pod.
        assert_eq!(plan.moves.len(), 4);
        assert!(plan.moves.iter().all(|m| m.to == pod(3)));

        let map = assignments_for(&plan, &map);
        let counts = counts(&map);
        assert_eq!(counts[&pod(1)], 4);
        assert_eq!(counts[&pod(2)], 4);
        assert_eq!(counts[&pod(3)], 4);
    }

    #[test]
    fn moves_pick_smallest_shards_first() {
        let mut map = AssignmentMap::new();
        for id in 0..8 {
            map.insert(ShardId::new(id), Some(pod(1)));
        }
        let plan = plan_rebalance(&map, &pods(&[1, 2]), 8, 1.0);
        let moved: Vec<u32> = plan.moves.iter().map(|m| m.shard.0).collect();
        assert_eq!(moved, vec![0, 1, 2, 3]);
    }

    #[test]
    fn rate_bounds_moves_per_pass() {
        let mut map = AssignmentMap::new();
        for id in 0..12 {
            map.insert(ShardId::new(id), Some(pod(1)));
        }
        // ceil(0.25 * 12) = 3 moves max.
        let plan = plan_rebalance(&map, &pods(&[1, 2]), 12, 0.25);
        assert_eq!(plan.moves.len(), 3);
    }

    #[test]
    fn tiny_rate_still_makes_one_move() {
        let mut map = AssignmentMap::new();
        for id in 0..12 {
            map.insert(ShardId::new(id), Some(pod(1)));
        }
        let plan = plan_rebalance(&map, &pods(&[1, 2]), 12, 0.001);
        assert_eq!(plan.moves.len(), 1);
    }

    #[test]
    fn rate_does_not_bound_unowned_placement() {
        let plan = plan_rebalance(&AssignmentMap::new(), &pods(&[1, 2]), 12, 0.001);
        assert_eq!(plan.assign_unowned.len(), 12);
    }

    #[test]
    fn shards_of_departed_pods_are_unowned() {
        let mut map = AssignmentMap::new();
        for id in 0..6 {
            map.insert(ShardId::new(id), Some(pod(9)));
        }
        let plan = plan_rebalance(&map, &pods(&[1, 2]), 6, 1.0);
        assert_eq!(plan.assign_unowned.len(), 6);
        assert!(plan.moves.is_empty());
    }

    #[test]
    fn plan_is_deterministic() {
        let mut map = AssignmentMap::new();
        for id in 0..32 {
            map.insert(ShardId::new(id), Some(pod((id % 2 + 1) as u8)));
        }
        let set = pods(&[1, 2, 3, 4]);
        let a = plan_rebalance(&map, &set, 32, 0.5);
        let b = plan_rebalance(&map, &set, 32, 0.5);
        assert_eq!(a.assign_unowned, b.assign_unowned);
        assert_eq!(a.moves, b.moves);
    }
}
