//! Shard Manager: the control plane that partitions a fixed, integer-indexed
//! shard space across a dynamic fleet of stateless runner processes and
//! keeps the assignment balanced, healthy, and monotonic under churn.
//!
//! The crate is organized leaves-first, mirroring the dependency order in
//! which the components were built: [`store`] (authoritative state) →
//! [`engine`] (pure assignment/rebalance decisions) → [`control`] (the
//! event-driven loop that ties them together) → [`health`], [`notify`],
//! [`persist`] (the collaborators the loop drives). [`rpc`] binds the
//! runner-facing command API to a concrete `tonic` transport.

pub mod clock;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod health;
pub mod metrics;
pub mod model;
pub mod notify;
pub mod persist;
pub mod rpc;
pub mod store;

#[allow(clippy::large_enum_variant)]
pub mod proto {
    tonic::include_proto!("shardmanager.v1");

    pub const FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("shard_manager_descriptor");
}

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::config::ShardManagerConfig;
use crate::control::{ControlLoop, EventSender};
use crate::error::ManagerError;
use crate::health::{HealthCheck, HealthProber};
use crate::metrics::Metrics;
use crate::notify::Notifier;
use crate::persist::Persister;
use crate::store::StateStore;

/// Assembled runtime: the state store, notifier, and the handles needed to
/// drive the control loop and health prober, wired together and recovered
/// from durable storage on startup.
///
/// This is the seam an embedding binary (or a test) uses instead of poking
/// at the individual components directly.
pub struct ShardManager {
    pub store: Arc<StateStore>,
    pub notifier: Arc<Notifier>,
    pub events: EventSender,
    pub metrics: Arc<Metrics>,
    pub clock: Arc<dyn Clock>,
    control_handle: JoinHandle<Result<(), ManagerError>>,
    prober_handle: JoinHandle<()>,
    // The persister (and, if configured, the rebalance ticker) each hold
    // their own `EventSender` clone for as long as they run and never exit
    // on their own, so they must be cancelled directly rather than waited
    // on — see `ControlLoop::spawn`.
    background_handles: Vec<JoinHandle<()>>,
}

impl ShardManager {
    /// Runs recovery (loads the persisted snapshot, if any, before intake
    /// opens), then spawns the control loop and the health prober.
    pub async fn bootstrap<H>(
        config: ShardManagerConfig,
        persister: Arc<dyn Persister>,
        health_check: Arc<H>,
        metrics: Arc<Metrics>,
    ) -> anyhow::Result<Self>
    where
        H: HealthCheck + 'static,
    {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let store = match persister.load().await? {
            Some(mut state) => {
                // Runners restored from a snapshot are unverified until their
                // first heartbeat or successful ping; the prober starts
                // probing them on its very first tick rather than waiting out
                // a full liveness_threshold.
                for runner in &mut state.runners {
                    runner.verified = false;
                }
                info!(
                    runners = state.runners.len(),
                    total_shards = state.total_shards,
                    "restored state from persisted snapshot"
                );
                Arc::new(StateStore::from_persisted(state))
            }
            None => {
                info!(total_shards = config.total_shards, "starting with an empty state store");
                Arc::new(StateStore::new(config.total_shards))
            }
        };

        let notifier = Arc::new(Notifier::new(config.notification_buffer));

        let (control_handle, events, background_handles) = ControlLoop::spawn(
            store.clone(),
            notifier.clone(),
            persister,
            clock.clone(),
            metrics.clone(),
            config.clone(),
        );

        let prober = HealthProber::new(health_check, store.clone(), events.clone(), clock.clone(), config);
        let prober_handle = tokio::spawn(prober.run());

        Ok(Self {
            store,
            notifier,
            events,
            metrics,
            clock,
            control_handle,
            prober_handle,
            background_handles,
        })
    }

    /// Orderly shutdown: cancel the prober and the control
    /// loop's background helpers first (in-flight pings are abandoned, no
    /// final rebalance is forced), then let the control loop itself drain
    /// whatever is already in its event queue and exit once every
    /// `EventSender` clone — including the caller's own, dropped here — has
    /// gone out of scope. Callers that bind a gRPC server to `events` should
    /// stop accepting new connections before calling this.
    pub async fn shutdown(self) {
        self.prober_handle.abort();
        for handle in &self.background_handles {
            handle.abort();
        }
        drop(self.events);
        match self.control_handle.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::error!(reason = %err, "control loop had already exited fatally"),
            Err(join_err) if join_err.is_cancelled() => {}
            Err(join_err) => tracing::error!(error = %join_err, "control loop task panicked"),
        }
    }

    /// Lets the embedding binary treat a fatal invariant violation the same
    /// way it treats a crashed listener task — join this
    /// alongside the transport servers in a `select!` and exit the process
    /// if it resolves before an explicit shutdown is requested.
    pub fn control_loop_handle(&mut self) -> &mut JoinHandle<Result<(), ManagerError>> {
        &mut self.control_handle
    }
}
