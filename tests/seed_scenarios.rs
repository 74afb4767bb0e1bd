//! End-to-end exercises of the six seed scenarios: a full `ControlLoop`
//! (plus, where relevant, a `HealthProber`) wired up the same way
//! `ShardManager::bootstrap` wires them, driven through `EventSender` the
//! way the gRPC layer would.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinHandle;

use shard_manager::clock::SystemClock;
use shard_manager::config::ShardManagerConfig;
use shard_manager::control::{ControlLoop, EventSender};
use shard_manager::error::ManagerError;
use shard_manager::health::{HealthCheck, HealthProber};
use shard_manager::metrics::Metrics;
use shard_manager::model::{RunnerAddress, RunnerVersion};
use shard_manager::notify::Notifier;
use shard_manager::persist::{FilePersister, NoopPersister, Persister};
use shard_manager::store::StateStore;

fn addr(host: &str) -> RunnerAddress {
    RunnerAddress {
        host: host.to_string(),
        port: 9000,
    }
}

fn load_by_runner(store: &StateStore) -> HashMap<RunnerAddress, usize> {
    let mut load = HashMap::new();
    for owner in store.all_assignments().values() {
        if let Some(runner) = owner.runner() {
            *load.entry(runner.clone()).or_insert(0usize) += 1;
        }
    }
    load
}

struct Harness {
    store: Arc<StateStore>,
    events: EventSender,
    handle: JoinHandle<Result<(), ManagerError>>,
    background: Vec<JoinHandle<()>>,
}

impl Harness {
    fn spawn(total_shards: u32, config: ShardManagerConfig) -> Self {
        let store = Arc::new(StateStore::new(total_shards));
        let notifier = Arc::new(Notifier::new(32));
        let persister = Arc::new(NoopPersister);
        let metrics = Arc::new(Metrics::standalone());
        let (handle, events, background) = ControlLoop::spawn(
            store.clone(),
            notifier,
            persister,
            Arc::new(SystemClock),
            metrics,
            config,
        );
        Self { store, events, handle, background }
    }

    async fn register(&self, host: &str, version: u64) {
        self.events
            .register(addr(host), RunnerVersion(version), Utc::now())
            .await
            .expect("register must succeed for a fresh address");
    }

    async fn unregister(&self, host: &str) {
        self.events
            .unregister(addr(host))
            .await
            .expect("unregister must succeed for a registered address");
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.handle.abort();
        for task in &self.background {
            task.abort();
        }
    }
}

fn debounced_config() -> ShardManagerConfig {
    let mut config = ShardManagerConfig::default();
    config.rebalance_debounce = Duration::from_millis(10);
    config
}

/// S1: starting from an empty cluster, registering a batch of same-version
/// runners settles on an even distribution once debounce fires — every
/// shard owned, load spread within one of the mean.
#[tokio::test]
async fn s1_empty_start_settles_into_an_even_distribution() {
    let harness = Harness::spawn(300, debounced_config());
    assert!(harness.store.all_assignments().values().all(|o| o.is_unassigned()));

    for i in 0..30 {
        harness.register(&format!("r{i}"), 1).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let assignments = harness.store.all_assignments();
    assert_eq!(assignments.len(), 300);
    assert!(assignments.values().all(|o| !o.is_unassigned()));

    let load = load_by_runner(&harness.store);
    assert_eq!(load.len(), 30);
    let max = *load.values().max().unwrap();
    let min = *load.values().min().unwrap();
    assert!(max - min <= 1, "load should be balanced within one shard, got {load:?}");
}

/// S2: a runner announcing a newer version than the rest of the fleet only
/// ever picks up shards that were unassigned; it never displaces an owner
/// already running the current max version.
#[tokio::test]
async fn s2_new_version_only_claims_unassigned_shards() {
    let harness = Harness::spawn(310, debounced_config());

    for i in 0..30 {
        harness.register(&format!("r{i}"), 1).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    let before = harness.store.all_assignments();
    assert!(before.values().all(|o| !o.is_unassigned()));

    // r31 announces a newer version; it can only ever pick up the 10 shards
    // still unassigned, never one already owned by a v1 runner.
    harness.register("r31", 2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let after = harness.store.all_assignments();
    let owned_by_r31 = harness.store.assignments_for_runner(&addr("r31"));
    assert_eq!(owned_by_r31.len(), 10);
    for (shard, owner) in &before {
        if !owner.is_unassigned() {
            assert_eq!(after[shard], *owner, "a v1 owner must never be displaced by a newer version");
        }
    }
}

/// S3: unregistering a loaded runner drains its shards immediately, and the
/// debounced rebalance round spreads them across the survivors without the
/// departed runner ever reappearing as an owner.
#[tokio::test]
async fn s3_unregister_drains_and_redistributes() {
    let harness = Harness::spawn(120, debounced_config());

    for i in 0..4 {
        harness.register(&format!("r{i}"), 1).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(harness.store.all_assignments().values().all(|o| !o.is_unassigned()));

    let owned_by_r0_before = harness.store.assignments_for_runner(&addr("r0"));
    assert!(!owned_by_r0_before.is_empty());

    harness.unregister("r0").await;
    // remove_runner unassigns in the same commit: no transient state where
    // r0 still owns shards after the call returns.
    assert!(harness
        .store
        .all_assignments()
        .values()
        .all(|o| o.runner() != Some(&addr("r0"))));

    tokio::time::sleep(Duration::from_millis(100)).await;

    let after = harness.store.all_assignments();
    assert!(after.values().all(|o| !o.is_unassigned()), "every shard must be reassigned after debounce");
    assert!(after.values().all(|o| o.runner() != Some(&addr("r0"))));
}

/// S4: unregistering an entire fleet leaves every shard unassigned, not
/// stuck pointing at a runner that no longer exists.
#[tokio::test]
async fn s4_mass_churn_leaves_everything_unassigned() {
    let harness = Harness::spawn(150, debounced_config());

    for i in 0..50 {
        harness.register(&format!("r{i}"), 1).await;
    }
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(harness.store.all_assignments().values().all(|o| !o.is_unassigned()));

    for i in 0..50 {
        harness.unregister(&format!("r{i}")).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(harness.store.all_assignments().values().all(|o| o.is_unassigned()));
    assert!(harness.store.all_runners().is_empty());
}

/// S5: a manager restarted from a persisted snapshot reconstructs the exact
/// assignment map it had before the restart, and runners that never send a
/// heartbeat afterward are evicted (shards unassigned again) once the
/// liveness threshold sweep catches them.
#[tokio::test]
async fn s5_persistence_replay_then_liveness_eviction() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot_path = dir.path().join("snapshot.json");

    let before_assignments = {
        let store = Arc::new(StateStore::new(60));
        let notifier = Arc::new(Notifier::new(32));
        let persister: Arc<dyn Persister> =
            Arc::new(FilePersister::new(snapshot_path.clone()));
        let metrics = Arc::new(Metrics::standalone());
        let (handle, events, background) = ControlLoop::spawn(
            store.clone(),
            notifier,
            persister,
            Arc::new(SystemClock),
            metrics,
            debounced_config(),
        );

        for i in 0..6 {
            events
                .register(addr(&format!("r{i}")), RunnerVersion(1), Utc::now())
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        // give the persister task a moment to flush the final commit
        tokio::time::sleep(Duration::from_millis(50)).await;

        let assignments = store.all_assignments();
        handle.abort();
        for task in &background {
            task.abort();
        }
        assignments
    };
    assert!(before_assignments.values().all(|o| !o.is_unassigned()));

    // "Restart": a brand new store, rebuilt only from what made it to disk.
    let restored_persister = FilePersister::new(snapshot_path.clone());
    let restored_state = restored_persister
        .load()
        .await
        .unwrap()
        .expect("a snapshot must have been written before restart");
    let restored_store = Arc::new(StateStore::from_persisted(restored_state));

    assert_eq!(restored_store.all_assignments(), before_assignments);

    // Liveness sweep: no runner has heartbeat since restart, so with a
    // liveness_threshold of zero every one of them is immediately stale.
    let mut config = debounced_config();
    config.liveness_threshold = Duration::from_millis(0);
    config.max_strikes = 1;

    let notifier = Arc::new(Notifier::new(32));
    let persister: Arc<dyn Persister> = Arc::new(NoopPersister);
    let metrics = Arc::new(Metrics::standalone());
    let (handle, events, background) = ControlLoop::spawn(
        restored_store.clone(),
        notifier,
        persister,
        Arc::new(SystemClock),
        metrics,
        config.clone(),
    );

    struct AlwaysFails;
    #[async_trait]
    impl HealthCheck for AlwaysFails {
        async fn ping(&self, _address: &RunnerAddress, _timeout: Duration) -> bool {
            false
        }
    }

    let prober = HealthProber::new(
        Arc::new(AlwaysFails),
        restored_store.clone(),
        events.clone(),
        Arc::new(SystemClock),
        config,
    );
    prober.sweep().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(restored_store.all_runners().is_empty());
    assert!(restored_store.all_assignments().values().all(|o| o.is_unassigned()));
    handle.abort();
    for task in &background {
        task.abort();
    }
}

/// S6: a single runner going silent among an otherwise healthy fleet is
/// evicted once its failed-ping count reaches `max_strikes`, and its shards
/// land on the survivors rather than staying stuck unassigned.
#[tokio::test]
async fn s6_health_strikes_evict_one_runner_and_reassign_its_shards() {
    let mut config = debounced_config();
    config.liveness_threshold = Duration::from_millis(0);
    config.max_strikes = 3;

    let harness = Harness::spawn(100, config.clone());
    for i in 0..5 {
        harness.register(&format!("r{i}"), 1).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(harness.store.all_assignments().values().all(|o| !o.is_unassigned()));
    let owned_by_r4_before = harness.store.assignments_for_runner(&addr("r4"));
    assert!(!owned_by_r4_before.is_empty());

    struct FailsOne {
        target: RunnerAddress,
    }
    #[async_trait]
    impl HealthCheck for FailsOne {
        async fn ping(&self, address: &RunnerAddress, _timeout: Duration) -> bool {
            address != &self.target
        }
    }

    let prober = HealthProber::new(
        Arc::new(FailsOne { target: addr("r4") }),
        harness.store.clone(),
        harness.events.clone(),
        Arc::new(SystemClock),
        config,
    );

    // Two strikes: not yet at the limit, r4 is still registered.
    prober.sweep().await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    prober.sweep().await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(harness.store.all_runners().iter().any(|r| r.address == addr("r4")));

    // Third strike crosses max_strikes: r4 is evicted.
    prober.sweep().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(harness.store.all_runners().iter().all(|r| r.address != addr("r4")));
    let assignments = harness.store.all_assignments();
    assert!(assignments.values().all(|o| !o.is_unassigned()), "r4's shards must be reassigned, not left unassigned");
    assert!(assignments.values().all(|o| o.runner() != Some(&addr("r4"))));

    let owned_by_r4_after: Vec<_> = harness.store.assignments_for_runner(&addr("r4"));
    assert!(owned_by_r4_after.is_empty());
}
