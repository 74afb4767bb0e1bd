//! Assignment engine: pure, synchronous, deterministic. No I/O, no clock,
//! no randomness. Given a snapshot, computes shard moves. Kept free of
//! `tokio`/`tracing` imports by design, so its determinism is a plain
//! unit test with no async runtime involved.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};

use crate::model::{Owner, RunnerAddress, RunnerVersion, ShardId, StoreSnapshot};

/// Assigns currently-unassigned shards to the least-loaded runner at the
/// maximum observed version (the "version gate").
///
/// Returns a map covering a subset of `snapshot.unassigned_shards()`; if
/// there are no registered runners, or none at the max version, the map is
/// empty and shards remain unassigned.
pub fn assign_unassigned(snapshot: &StoreSnapshot) -> BTreeMap<ShardId, RunnerAddress> {
    let mut result = BTreeMap::new();

    let Some(max_version) = snapshot.max_version() else {
        return result;
    };

    // Candidates: runners at the max version, ordered so the least loaded
    // (ties broken by address) pops first. `Reverse` turns the `BinaryHeap`
    // max-heap into the min-heap this needs.
    let mut candidates: BinaryHeap<Reverse<(usize, RunnerAddress)>> = snapshot
        .runners
        .values()
        .filter(|r| r.version == max_version)
        .map(|r| Reverse((snapshot.load_of(&r.address), r.address.clone())))
        .collect();

    if candidates.is_empty() {
        return result;
    }

    let unassigned = snapshot.unassigned_shards();

    // Walk shards in ascending id order, always handing the next shard to
    // whichever candidate is currently least loaded: pop the minimum, hand
    // it the shard, push it back with its load incremented. O(|R| log |R|)
    // to build the heap plus O(log |R|) per shard, never a full re-sort.
    for shard in unassigned {
        let Reverse((load, address)) = candidates.pop().expect("checked non-empty above");
        result.insert(shard, address.clone());
        candidates.push(Reverse((load + 1, address)));
    }

    result
}

/// Computes vacate moves that reduce imbalance. Never reassigns directly:
/// returns the set of shards to unassign. The
/// caller is expected to run [`assign_unassigned`] again afterwards on the
/// resulting snapshot to place them on healthier/lighter runners.
pub fn plan_rebalance(snapshot: &StoreSnapshot, move_budget: usize) -> Vec<ShardId> {
    let mut vacate = Vec::new();
    if move_budget == 0 {
        return vacate;
    }

    // Group runners by version; each version class is balanced
    // independently against its own target load.
    let mut by_version: BTreeMap<RunnerVersion, Vec<RunnerAddress>> = BTreeMap::new();
    for runner in snapshot.runners.values() {
        by_version
            .entry(runner.version)
            .or_default()
            .push(runner.address.clone());
    }

    for runners in by_version.values() {
        if runners.is_empty() {
            continue;
        }

        let owned_per_runner: BTreeMap<&RunnerAddress, usize> = runners
            .iter()
            .map(|addr| (addr, snapshot.load_of(addr)))
            .collect();

        let total_owned: usize = owned_per_runner.values().sum();
        let target = total_owned.div_ceil(runners.len());

        // Tie-break: prefer vacating from the runner with the largest
        // overload; within a runner, prefer the highest-id shard first.
        let mut overloaded: Vec<(&RunnerAddress, usize)> = owned_per_runner
            .iter()
            .filter(|(_, &load)| load > target + 1)
            .map(|(addr, &load)| (*addr, load - target))
            .collect();
        overloaded.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

        for (runner, overload) in overloaded {
            let mut shards: Vec<ShardId> = snapshot
                .assignments
                .iter()
                .filter(|(_, owner)| owner.runner() == Some(runner))
                .map(|(shard, _)| *shard)
                .collect();
            shards.sort_by(|a, b| b.cmp(a));

            for shard in shards.into_iter().take(overload) {
                vacate.push(shard);
                if vacate.len() >= move_budget {
                    return vacate;
                }
            }
        }
    }

    vacate
}
