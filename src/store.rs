//! In-memory authoritative view of registered runners and the shard
//! assignment map, protected by a single coarse lock. The control loop
//! only ever holds this lock across synchronous critical sections, so a
//! plain `std::sync::Mutex` is the right tool here, never a
//! `tokio::sync::Mutex`.

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::error::ManagerError;
use crate::model::{
    AssignmentMap, Delta, Owner, PersistedState, RunnerAddress, RunnerRecord, RunnerVersion,
    ShardId, StoreSnapshot,
};

pub struct StateStore {
    inner: Mutex<Inner>,
}

struct Inner {
    total_shards: u32,
    runners: BTreeMap<RunnerAddress, RunnerRecord>,
    assignments: AssignmentMap,
}

impl StateStore {
    /// Creates an empty store with every shard in `[1, total_shards]`
    /// unassigned. No shard is ever absent from the map.
    pub fn new(total_shards: u32) -> Self {
        let assignments = (1..=total_shards)
            .map(|i| (ShardId(i), Owner::Unassigned))
            .collect();
        Self {
            inner: Mutex::new(Inner {
                total_shards,
                runners: BTreeMap::new(),
                assignments,
            }),
        }
    }

    /// Restores a store from a persisted snapshot. Runners
    /// are inserted as given; the caller is responsible for marking them
    /// `verified = false` before calling this if that policy applies.
    pub fn from_persisted(state: PersistedState) -> Self {
        let runners = state
            .runners
            .into_iter()
            .map(|r| (r.address.clone(), r))
            .collect();
        let assignments = state.assignments.into_iter().collect();
        Self {
            inner: Mutex::new(Inner {
                total_shards: state.total_shards,
                runners,
                assignments,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Read-only snapshot of every registered runner.
    pub fn all_runners(&self) -> Vec<RunnerRecord> {
        self.lock().runners.values().cloned().collect()
    }

    /// Read-only snapshot of the full assignment map.
    pub fn all_assignments(&self) -> AssignmentMap {
        self.lock().assignments.clone()
    }

    /// Shards currently owned by `address`.
    pub fn assignments_for_runner(&self, address: &RunnerAddress) -> Vec<ShardId> {
        self.lock()
            .assignments
            .iter()
            .filter(|(_, owner)| owner.runner() == Some(address))
            .map(|(shard, _)| *shard)
            .collect()
    }

    /// A clone of the full state, for the (pure) assignment engine and
    /// for the persister.
    pub fn snapshot(&self) -> StoreSnapshot {
        let inner = self.lock();
        StoreSnapshot {
            total_shards: inner.total_shards,
            runners: inner.runners.clone(),
            assignments: inner.assignments.clone(),
        }
    }

    pub fn to_persisted(&self) -> PersistedState {
        let inner = self.lock();
        PersistedState {
            total_shards: inner.total_shards,
            runners: inner.runners.values().cloned().collect(),
            assignments: inner.assignments.iter().map(|(s, o)| (*s, o.clone())).collect(),
        }
    }

    /// Registers a runner. Idempotent on `(address, version)`: a
    /// re-registration at the same version just refreshes the heartbeat;
    /// at a different version it updates `version` in place (the runner
    /// identity, its address, does not change).
    pub fn add_runner(&self, address: RunnerAddress, version: RunnerVersion, now: DateTime<Utc>) {
        let mut inner = self.lock();
        inner
            .runners
            .entry(address.clone())
            .and_modify(|r| {
                r.version = version;
                r.last_heartbeat = now;
                r.strikes = 0;
                r.verified = true;
            })
            .or_insert(RunnerRecord {
                address,
                version,
                registered_at: now,
                last_heartbeat: now,
                strikes: 0,
                verified: true,
            });
    }

    /// Removes a runner and unassigns all of its shards in the same
    /// commit, so no transient state where the runner is gone but its
    /// shards still point to it is ever visible to readers. Returns the
    /// delta produced (the removed shards, for this runner).
    pub fn remove_runner(&self, address: &RunnerAddress) -> Result<Delta, ManagerError> {
        let mut inner = self.lock();
        if inner.runners.remove(address).is_none() {
            return Err(ManagerError::unknown_runner(address));
        }

        let mut delta = Delta::default();
        for (shard, owner) in inner.assignments.iter_mut() {
            if owner.runner() == Some(address) {
                *owner = Owner::Unassigned;
                delta.record_removed(address.clone(), *shard);
            }
        }
        Ok(delta)
    }

    pub fn touch_heartbeat(&self, address: &RunnerAddress, now: DateTime<Utc>) -> Result<(), ManagerError> {
        let mut inner = self.lock();
        match inner.runners.get_mut(address) {
            Some(r) => {
                r.last_heartbeat = now;
                r.strikes = 0;
                r.verified = true;
                Ok(())
            }
            None => Err(ManagerError::unknown_runner(address)),
        }
    }

    pub fn record_strike(&self, address: &RunnerAddress) -> Result<u32, ManagerError> {
        let mut inner = self.lock();
        match inner.runners.get_mut(address) {
            Some(r) => {
                r.strikes += 1;
                Ok(r.strikes)
            }
            None => Err(ManagerError::unknown_runner(address)),
        }
    }

    /// Atomically applies a batch of (shard, new owner) pairs. Partial
    /// application is forbidden: every entry is validated against the
    /// current runner set before any mutation is made.
    pub fn apply_assignments(
        &self,
        moves: &BTreeMap<ShardId, Owner>,
    ) -> Result<Delta, ManagerError> {
        let mut inner = self.lock();

        for (shard, owner) in moves {
            if shard.0 == 0 || shard.0 > inner.total_shards {
                return Err(ManagerError::unknown_shard(*shard));
            }
            if let Owner::Runner(addr) = owner {
                if !inner.runners.contains_key(addr) {
                    return Err(ManagerError::invariant(format!(
                        "attempted to assign shard {shard} to unregistered runner {addr}"
                    )));
                }
            }
        }

        let mut delta = Delta::default();
        for (shard, new_owner) in moves {
            let previous = inner
                .assignments
                .get(shard)
                .cloned()
                .unwrap_or(Owner::Unassigned);
            if &previous == new_owner {
                continue;
            }
            if let Some(old_addr) = previous.runner() {
                delta.record_removed(old_addr.clone(), *shard);
            }
            if let Some(new_addr) = new_owner.runner() {
                delta.record_added(new_addr.clone(), *shard);
            }
            inner.assignments.insert(*shard, new_owner.clone());
        }

        Ok(delta)
    }
}
