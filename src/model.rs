//! Core data model: shards, runners, and the assignment map.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A shard identifier in `[1, total_shards]`. Opaque to the manager; the
/// mapping from entity key to shard is an external concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardId(pub u32);

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `(host, port)` pair identifying a runner over the RPC transport.
/// Compared by value; `Ord` gives the lexicographic tie-break the
/// assignment engine relies on (host then port).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunnerAddress {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for RunnerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Monotonically non-decreasing deployed software version. Used by the
/// version gate during rolling upgrades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunnerVersion(pub u64);

/// A registered runner's bookkeeping state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerRecord {
    pub address: RunnerAddress,
    pub version: RunnerVersion,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    /// Consecutive failed health pings since the last success. Reset on
    /// `Heartbeat` or a successful ping.
    pub strikes: u32,
    /// `false` for runners restored from a persisted snapshot until their
    /// first heartbeat or successful ping.
    pub verified: bool,
}

/// The owner of a shard: either a specific runner, or nobody yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Owner {
    Unassigned,
    Runner(RunnerAddress),
}

impl Owner {
    pub fn runner(&self) -> Option<&RunnerAddress> {
        match self {
            Owner::Unassigned => None,
            Owner::Runner(addr) => Some(addr),
        }
    }

    pub fn is_unassigned(&self) -> bool {
        matches!(self, Owner::Unassigned)
    }
}

/// Total mapping `shard -> owner`. Every shard in `[1, total_shards]` is
/// always present; no shard is ever absent from the map.
pub type AssignmentMap = BTreeMap<ShardId, Owner>;

/// Per-runner difference between two consecutive assignment snapshots,
/// used for notification and persistence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerDelta {
    pub added: BTreeSet<ShardId>,
    pub removed: BTreeSet<ShardId>,
}

impl RunnerDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// A full delta produced by a single committed mutation, keyed by the
/// runners it affects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delta {
    pub per_runner: BTreeMap<RunnerAddress, RunnerDelta>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.per_runner.values().all(RunnerDelta::is_empty)
    }

    pub fn record_added(&mut self, runner: RunnerAddress, shard: ShardId) {
        self.per_runner.entry(runner).or_default().added.insert(shard);
    }

    pub fn record_removed(&mut self, runner: RunnerAddress, shard: ShardId) {
        self.per_runner.entry(runner).or_default().removed.insert(shard);
    }
}

/// Snapshot of the authoritative state, handed to the pure assignment
/// engine and to the persister. Cheap to clone: callers outside the
/// control loop should never hold the store's lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSnapshot {
    pub total_shards: u32,
    pub runners: BTreeMap<RunnerAddress, RunnerRecord>,
    pub assignments: AssignmentMap,
}

impl StoreSnapshot {
    pub fn unassigned_shards(&self) -> Vec<ShardId> {
        self.assignments
            .iter()
            .filter(|(_, owner)| owner.is_unassigned())
            .map(|(shard, _)| *shard)
            .collect()
    }

    pub fn load_of(&self, address: &RunnerAddress) -> usize {
        self.assignments
            .values()
            .filter(|owner| owner.runner() == Some(address))
            .count()
    }

    pub fn max_version(&self) -> Option<RunnerVersion> {
        self.runners.values().map(|r| r.version).max()
    }
}

/// The persisted mirror of the authoritative state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedState {
    pub total_shards: u32,
    pub runners: Vec<RunnerRecord>,
    pub assignments: Vec<(ShardId, Owner)>,
}
