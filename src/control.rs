//! The control loop: a single task that owns every mutation of the state
//! store. All other components — the RPC layer, the health prober, the
//! persister — talk to it by sending events and, where a reply is
//! expected, waiting on a `oneshot`. Keeping mutation behind one task
//! means the two-phase rebalance commit and the debounce timer never
//! race with a concurrent register or heartbeat.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::ShardManagerConfig;
use crate::engine;
use crate::error::ManagerError;
use crate::metrics::Metrics;
use crate::model::{AssignmentMap, Delta, RunnerAddress, RunnerVersion, ShardId};
use crate::notify::Notifier;
use crate::persist::Persister;
use crate::store::StateStore;

pub enum Event {
    Register {
        address: RunnerAddress,
        version: RunnerVersion,
        now: DateTime<Utc>,
        reply: oneshot::Sender<Result<Vec<ShardId>, ManagerError>>,
    },
    Unregister {
        address: RunnerAddress,
        reply: oneshot::Sender<Result<(), ManagerError>>,
    },
    Heartbeat {
        address: RunnerAddress,
        now: DateTime<Utc>,
        reply: oneshot::Sender<Result<(), ManagerError>>,
    },
    GetAssignments {
        reply: oneshot::Sender<AssignmentMap>,
    },
    /// Result of an out-of-band ping performed by the health prober.
    PingResult { address: RunnerAddress, alive: bool },
    /// A background persist job finished, successfully or not.
    Persisted(u64),
    PersistFailed,
    /// Metrics-only marker; the prober's own sweep already did the real
    /// staleness work and injected `PingResult` events for anything it
    /// found.
    HealthTick,
    /// Drift-correction timer, only enqueued when `rebalance_interval` is
    /// configured. Schedules a rebalance round the same way any other
    /// mutating event does, on top of the debounce-triggered ones.
    Tick,
}

/// Cheaply cloned handle used by every producer of events.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<Event>,
}

impl EventSender {
    pub async fn register(
        &self,
        address: RunnerAddress,
        version: RunnerVersion,
        now: DateTime<Utc>,
    ) -> Result<Vec<ShardId>, ManagerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Event::Register {
            address,
            version,
            now,
            reply,
        })
        .await;
        rx.await.unwrap_or(Err(ManagerError::invariant("control loop dropped reply")))
    }

    pub async fn unregister(&self, address: RunnerAddress) -> Result<(), ManagerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Event::Unregister { address, reply }).await;
        rx.await.unwrap_or(Err(ManagerError::invariant("control loop dropped reply")))
    }

    pub async fn heartbeat(&self, address: RunnerAddress, now: DateTime<Utc>) -> Result<(), ManagerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Event::Heartbeat { address, now, reply }).await;
        rx.await.unwrap_or(Err(ManagerError::invariant("control loop dropped reply")))
    }

    pub async fn get_assignments(&self) -> AssignmentMap {
        let (reply, rx) = oneshot::channel();
        self.send(Event::GetAssignments { reply }).await;
        rx.await.unwrap_or_default()
    }

    pub fn notify_ping_result(&self, address: RunnerAddress, alive: bool) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(Event::PingResult { address, alive }).await;
        });
    }

    pub fn notify_tick(&self) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(Event::HealthTick).await;
        });
    }

    pub fn notify_rebalance_tick(&self) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(Event::Tick).await;
        });
    }

    fn notify_persisted(&self, version: u64) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(Event::Persisted(version)).await;
        });
    }

    fn notify_persist_failed(&self) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(Event::PersistFailed).await;
        });
    }

    async fn send(&self, event: Event) {
        let _ = self.tx.send(event).await;
    }
}

struct PersistJob {
    version: u64,
    state: crate::model::PersistedState,
}

pub struct ControlLoop {
    store: Arc<StateStore>,
    notifier: Arc<Notifier>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    config: ShardManagerConfig,
    // `rx` is the last surviving end of the event channel: the loop must
    // never hold its own `EventSender` clone, or the channel would never
    // close and `ShardManager::shutdown` would wait on `run()` forever.
    rx: mpsc::Receiver<Event>,
    persist_tx: mpsc::UnboundedSender<PersistJob>,
    commit_version: u64,
    durable_version: u64,
    debounce_deadline: Option<Instant>,
}

impl ControlLoop {
    /// Spawns the control loop plus its background helper tasks (the
    /// persister, and the rebalance ticker when configured), returning a
    /// handle to the loop task, the sender every other component uses to
    /// reach it, and the helper tasks' own handles.
    ///
    /// The helper tasks each hold their own `EventSender` clone for their
    /// entire lifetime and never exit on their own, so they are returned
    /// separately rather than folded into `control_handle`: `rx.recv()`
    /// only observes channel closure once every sender, including theirs,
    /// is gone, so a caller that wants an orderly shutdown must abort them
    /// explicitly (see `ShardManager::shutdown`) rather than wait for it.
    pub fn spawn(
        store: Arc<StateStore>,
        notifier: Arc<Notifier>,
        persister: Arc<dyn Persister>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
        config: ShardManagerConfig,
    ) -> (JoinHandle<Result<(), ManagerError>>, EventSender, Vec<JoinHandle<()>>) {
        let (tx, rx) = mpsc::channel(1024);
        let events = EventSender { tx };
        let (persist_tx, persist_rx) = mpsc::unbounded_channel();

        let mut background = vec![tokio::spawn(run_persister(
            persister,
            persist_rx,
            events.clone(),
            config.persist_retry_backoff,
        ))];

        if let Some(interval) = config.rebalance_interval {
            background.push(tokio::spawn(run_rebalance_ticker(events.clone(), interval)));
        }

        let control = ControlLoop {
            store,
            notifier,
            clock,
            metrics,
            config,
            rx,
            persist_tx,
            commit_version: 0,
            durable_version: 0,
            debounce_deadline: None,
        };

        let handle = tokio::spawn(control.run());
        (handle, events, background)
    }

    /// Runs until the event channel closes (`Ok(())`, ordinary shutdown) or
    /// an invariant violation is detected (`Err`: fatal, the manager stops
    /// accepting events and exits — a supervisor is expected to restart it
    /// and let recovery replay the last persisted snapshot). The caller
    /// (`ShardManager`'s embedder) is expected to treat `Err` from this task
    /// as fatal to the whole process, the same way it would a crashed
    /// listener.
    async fn run(mut self) -> Result<(), ManagerError> {
        loop {
            let debounce_sleep = async {
                match self.debounce_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            let fatal = tokio::select! {
                event = self.rx.recv() => {
                    match event {
                        Some(event) => self.handle(event).await,
                        None => return Ok(()),
                    }
                }
                _ = debounce_sleep => {
                    self.debounce_deadline = None;
                    self.run_rebalance_round().await
                }
            };

            if let Some(err) = fatal {
                error!(reason = %err, "invariant violation detected, control loop exiting");
                return Err(err);
            }
        }
    }

    /// Returns `Some(err)` only when `err.is_fatal()` — the caller is
    /// expected to stop the loop on that signal rather than continue
    /// processing events.
    async fn handle(&mut self, event: Event) -> Option<ManagerError> {
        match event {
            Event::Register {
                address,
                version,
                now,
                reply,
            } => {
                self.store.add_runner(address.clone(), version, now);
                self.metrics.registered_runners.set(self.store.all_runners().len() as i64);
                let current = self.store.assignments_for_runner(&address);
                self.notifier.register(address.clone(), current.clone());
                self.schedule_rebalance();
                let _ = reply.send(Ok(current));
            }
            Event::Unregister { address, reply } => {
                let result = self.store.remove_runner(&address);
                match result {
                    Ok(delta) => {
                        self.metrics.registered_runners.set(self.store.all_runners().len() as i64);
                        self.notifier.unregister(&address);
                        self.commit(delta).await;
                        self.schedule_rebalance();
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Event::Heartbeat { address, now, reply } => {
                let result = self.store.touch_heartbeat(&address, now);
                let _ = reply.send(result);
            }
            Event::GetAssignments { reply } => {
                let _ = reply.send(self.store.all_assignments());
            }
            Event::PingResult { address, alive } => {
                if alive {
                    let _ = self.store.touch_heartbeat(&address, self.clock.now());
                    return None;
                }
                match self.store.record_strike(&address) {
                    Ok(strikes) => {
                        self.metrics.health_strikes_total.inc();
                        if strikes >= self.config.max_strikes {
                            if let Ok(delta) = self.store.remove_runner(&address) {
                                warn!(runner = %address, "evicted after exceeding the strike limit");
                                self.metrics.health_evictions_total.inc();
                                self.metrics.registered_runners.set(self.store.all_runners().len() as i64);
                                self.notifier.unregister(&address);
                                self.commit(delta).await;
                                self.schedule_rebalance();
                            }
                        }
                    }
                    Err(_) => {
                        debug!(runner = %address, "ping result for a runner that is no longer registered");
                    }
                }
            }
            Event::Persisted(version) => {
                if version > self.durable_version {
                    self.durable_version = version;
                }
                self.update_backlog_metric();
            }
            Event::PersistFailed => {
                self.update_backlog_metric();
            }
            Event::HealthTick => {}
            Event::Tick => {
                self.schedule_rebalance();
            }
        }
        None
    }

    fn schedule_rebalance(&mut self) {
        if self.debounce_deadline.is_none() {
            self.debounce_deadline = Some(Instant::now() + self.config.rebalance_debounce);
        }
    }

    fn backlog(&self) -> u64 {
        self.commit_version.saturating_sub(self.durable_version)
    }

    fn update_backlog_metric(&self) {
        self.metrics.persist_backlog.set(self.backlog() as i64);
    }

    /// A rebalance round is two sequential commits: first vacate
    /// overloaded shards, then assign every unassigned shard (the ones
    /// just vacated plus any that were already unassigned) to the
    /// least-loaded eligible runner. Splitting it this way means neither
    /// commit ever overwrites an owner in place, and the notifier's
    /// unassign-then-assign delivery order falls out for free.
    async fn run_rebalance_round(&mut self) -> Option<ManagerError> {
        if self.backlog() as usize > self.config.persist_backlog_bound {
            debug!(backlog = self.backlog(), "rebalance paused: persistence backlog too large");
            self.schedule_rebalance();
            return None;
        }

        let snapshot = self.store.snapshot();
        let to_vacate = engine::plan_rebalance(&snapshot, self.config.rebalance_move_budget);

        if !to_vacate.is_empty() {
            let moves: BTreeMap<ShardId, crate::model::Owner> = to_vacate
                .iter()
                .map(|shard| (*shard, crate::model::Owner::Unassigned))
                .collect();
            // `to_vacate` only ever names shards the snapshot just showed as
            // owned, and vacating never names a runner, so this can only
            // fail if the engine's output outlived the snapshot it was
            // computed from — impossible under the single-writer discipline.
            // Surfacing it as fatal rather than swallowing it is still the
            // right call if that invariant is ever broken.
            match self.store.apply_assignments(&moves) {
                Ok(delta) => {
                    if !delta.is_empty() {
                        self.commit(delta).await;
                    }
                }
                Err(e) if e.is_fatal() => return Some(e),
                Err(_) => {}
            }
        }

        let snapshot = self.store.snapshot();
        let assignments = engine::assign_unassigned(&snapshot);
        if assignments.is_empty() {
            self.metrics.rebalance_rounds_total.inc();
            self.metrics.unassigned_shards.set(snapshot.unassigned_shards().len() as i64);
            return None;
        }

        let moves: BTreeMap<ShardId, crate::model::Owner> = assignments
            .into_iter()
            .map(|(shard, addr)| (shard, crate::model::Owner::Runner(addr)))
            .collect();
        let move_count = moves.len();
        match self.store.apply_assignments(&moves) {
            Ok(delta) => {
                self.metrics.rebalance_rounds_total.inc();
                self.metrics.rebalance_moves_total.inc_by(move_count as u64);
                if !delta.is_empty() {
                    self.commit(delta).await;
                }
            }
            Err(e) if e.is_fatal() => return Some(e),
            Err(_) => {}
        }

        let snapshot = self.store.snapshot();
        self.metrics.unassigned_shards.set(snapshot.unassigned_shards().len() as i64);
        None
    }

    /// Common tail of every mutating event: bump the commit counter,
    /// enqueue a persist job, and fan the delta out to affected runners.
    async fn commit(&mut self, delta: Delta) {
        self.commit_version += 1;
        let _ = self.persist_tx.send(PersistJob {
            version: self.commit_version,
            state: self.store.to_persisted(),
        });
        self.update_backlog_metric();
        self.notifier.deliver(&delta).await;
    }
}

async fn run_persister(
    persister: Arc<dyn Persister>,
    mut jobs: mpsc::UnboundedReceiver<PersistJob>,
    events: EventSender,
    initial_backoff: Duration,
) {
    while let Some(job) = jobs.recv().await {
        let mut backoff = initial_backoff;
        loop {
            match persister.save(&job.state, job.version).await {
                Ok(()) => {
                    events.notify_persisted(job.version);
                    break;
                }
                Err(e) => {
                    warn!(version = job.version, error = %e, "snapshot persist failed, retrying");
                    events.notify_persist_failed();
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(30));
                }
            }
        }
    }
    info!("persister task exiting, event channel closed");
}

/// Drift-correction ticker: enqueues `Event::Tick` on a fixed cadence so a
/// rebalance round runs periodically even without register/unregister churn.
/// Only spawned when `rebalance_interval` is configured.
async fn run_rebalance_ticker(events: EventSender, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        events.notify_rebalance_tick();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::metrics::Metrics;
    use crate::persist::NoopPersister;

    fn addr(host: &str) -> RunnerAddress {
        RunnerAddress {
            host: host.to_string(),
            port: 1,
        }
    }

    fn spawn_loop(total_shards: u32) -> (Arc<StateStore>, JoinHandle<Result<(), ManagerError>>, EventSender) {
        let store = Arc::new(StateStore::new(total_shards));
        let notifier = Arc::new(Notifier::new(8));
        let persister = Arc::new(NoopPersister);
        let metrics = Arc::new(Metrics::standalone());
        let mut config = ShardManagerConfig::default();
        config.rebalance_debounce = Duration::from_millis(5);
        let (handle, events, _background) =
            ControlLoop::spawn(store.clone(), notifier, persister, Arc::new(SystemClock), metrics, config);
        (store, handle, events)
    }

    #[tokio::test]
    async fn register_then_rebalance_assigns_every_shard() {
        let (store, handle, events) = spawn_loop(10);
        events.register(addr("r1"), RunnerVersion(1), Utc::now()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        let assignments = store.all_assignments();
        assert!(assignments.values().all(|o| !o.is_unassigned()));
        handle.abort();
    }

    #[tokio::test]
    async fn unregister_unassigns_its_shards_immediately() {
        let (store, handle, events) = spawn_loop(4);
        events.register(addr("r1"), RunnerVersion(1), Utc::now()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.all_assignments().values().all(|o| !o.is_unassigned()));

        events.unregister(addr("r1")).await.unwrap();
        assert!(store.all_assignments().values().all(|o| o.is_unassigned()));
        handle.abort();
    }

    #[tokio::test]
    async fn heartbeat_on_unknown_runner_is_rejected() {
        let (_store, handle, events) = spawn_loop(4);
        let err = events.heartbeat(addr("ghost"), Utc::now()).await.unwrap_err();
        assert!(matches!(err, ManagerError::ClientMisuse { .. }));
        handle.abort();
    }

    #[tokio::test]
    async fn new_version_gets_newly_unassigned_shards() {
        let (store, handle, events) = spawn_loop(20);
        events.register(addr("r1"), RunnerVersion(1), Utc::now()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        events.register(addr("r2"), RunnerVersion(2), Utc::now()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let owned_by_r2 = store.assignments_for_runner(&addr("r2"));
        assert!(!owned_by_r2.is_empty());
        handle.abort();
    }

    #[tracing_test::traced_test]
    #[tokio::test]
    async fn eviction_logs_a_warning_with_the_runner_address() {
        let (store, handle, events) = spawn_loop(4);
        events.register(addr("r1"), RunnerVersion(1), Utc::now()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Default config allows 3 strikes before eviction.
        for _ in 0..3 {
            events.notify_ping_result(addr("r1"), false);
            tokio::task::yield_now().await;
        }

        assert!(store.all_runners().iter().all(|r| r.address != addr("r1")));
        assert!(tracing_test::logs_contain("evicted after exceeding the strike limit"));
        handle.abort();
    }
}
