//! Error taxonomy: a small tagged variant rather than a sprawling
//! per-module error union, so call sites can dispatch on the tag.

use crate::model::{RunnerAddress, ShardId};
use thiserror::Error;

/// Errors the core distinguishes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ManagerError {
    /// Ping or notifier-send failure. Logged, retried per policy, never
    /// terminates the loop.
    #[error("transient transport failure talking to {address}: {reason}")]
    Transient {
        address: RunnerAddress,
        reason: String,
    },

    /// Persistence failure. Logged, retried with backoff; commits continue
    /// but rebalance is paused while the unpersisted backlog exceeds the
    /// configured bound.
    #[error("persistence failure: {reason}")]
    Persistence { reason: String },

    /// Fatal: an invariant the state store is supposed to uphold has been
    /// violated (e.g. assignment to an unknown runner, duplicate commit
    /// version). The manager must stop accepting events and exit.
    #[error("invariant violation: {reason}")]
    Invariant { reason: String },

    /// Rejected client request: unknown address in `Heartbeat` or
    /// `Unregister` of a non-existent runner. State is left unchanged.
    #[error("client misuse: {reason}")]
    ClientMisuse { reason: String },
}

impl ManagerError {
    pub fn invariant(reason: impl Into<String>) -> Self {
        ManagerError::Invariant {
            reason: reason.into(),
        }
    }

    pub fn unknown_runner(address: &RunnerAddress) -> Self {
        ManagerError::ClientMisuse {
            reason: format!("runner {address} is not registered"),
        }
    }

    pub fn unknown_shard(shard: ShardId) -> Self {
        ManagerError::Invariant {
            reason: format!("shard {shard} is outside the configured range"),
        }
    }

    /// `true` for `Invariant`, the only kind that should abort the control
    /// loop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ManagerError::Invariant { .. })
    }
}
