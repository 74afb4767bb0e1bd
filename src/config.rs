//! Layered configuration: defaults, overridden by an optional TOML file,
//! overridden by `SHARD_MANAGER_*` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardManagerConfig {
    /// Fixed shard count `N`, immutable after cluster bootstrap.
    pub total_shards: u32,

    /// Commit-coalescing window for rebalance triggers.
    #[serde(with = "humantime_serde")]
    pub rebalance_debounce: Duration,

    /// Optional periodic rebalance cadence for drift correction, in
    /// addition to debounce-triggered rounds. `None` (the default)
    /// disables it.
    #[serde(with = "humantime_serde::option")]
    pub rebalance_interval: Option<Duration>,

    /// Per-round move budget for the rebalancer.
    pub rebalance_move_budget: usize,

    /// Duration after which a silent runner is probed.
    #[serde(with = "humantime_serde")]
    pub liveness_threshold: Duration,

    /// Per-tick interval the health prober runs on.
    #[serde(with = "humantime_serde")]
    pub health_tick_interval: Duration,

    /// Deadline given to each `Ping` RPC.
    #[serde(with = "humantime_serde")]
    pub ping_timeout: Duration,

    /// Max pings in flight at once.
    pub probe_concurrency: usize,

    /// Consecutive failed pings before a runner is evicted.
    pub max_strikes: u32,

    /// Starting backoff for persister retries after a failure.
    #[serde(with = "humantime_serde")]
    pub persist_retry_backoff: Duration,

    /// How many unpersisted commits may be in flight before rebalance is
    /// paused.
    pub persist_backlog_bound: usize,

    /// Per-runner notification channel capacity.
    pub notification_buffer: usize,

    /// gRPC listen port for the runner-facing command API.
    pub grpc_port: u16,

    /// Prometheus `/metrics` listen port.
    pub metrics_port: u16,

    /// Path to the JSON snapshot file used by `FilePersister`. `None`
    /// selects `NoopPersister` (ephemeral cluster).
    pub snapshot_path: Option<PathBuf>,

    pub tracing: TracingConfig,
}

impl Default for ShardManagerConfig {
    fn default() -> Self {
        Self {
            total_shards: 1000,
            rebalance_debounce: Duration::from_millis(300),
            rebalance_interval: None,
            rebalance_move_budget: 10_000,
            liveness_threshold: Duration::from_secs(10),
            health_tick_interval: Duration::from_secs(2),
            ping_timeout: Duration::from_secs(2),
            probe_concurrency: 16,
            max_strikes: 3,
            persist_retry_backoff: Duration::from_millis(200),
            persist_backlog_bound: 1,
            notification_buffer: 256,
            grpc_port: 9020,
            metrics_port: 9021,
            snapshot_path: Some(PathBuf::from("data/shard-manager-state.json")),
            tracing: TracingConfig::default(),
        }
    }
}

/// Safe-to-log rendering of the configuration, printed at startup. This
/// config carries no secrets today, but the trait keeps startup logging
/// uniform and gives a future storage backend (e.g. a database DSN) a
/// place to redact.
pub trait SafeDisplay {
    fn to_safe_string(&self) -> String;

    fn to_safe_string_indented(&self) -> String {
        self.to_safe_string()
            .lines()
            .map(|line| format!("  {line}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl SafeDisplay for ShardManagerConfig {
    fn to_safe_string(&self) -> String {
        format!(
            "total_shards: {}\nrebalance_debounce: {:?}\nrebalance_interval: {:?}\nliveness_threshold: {:?}\nping_timeout: {:?}\nprobe_concurrency: {}\nmax_strikes: {}\ngrpc_port: {}\nmetrics_port: {}\nsnapshot_path: {:?}",
            self.total_shards,
            self.rebalance_debounce,
            self.rebalance_interval,
            self.liveness_threshold,
            self.ping_timeout,
            self.probe_concurrency,
            self.max_strikes,
            self.grpc_port,
            self.metrics_port,
            self.snapshot_path,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Initializes the global `tracing` subscriber once, at process startup.
/// `RUST_LOG` (if set) overrides `tracing.level`; otherwise the configured
/// level applies to every target.
pub fn init_tracing(config: &TracingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.level.clone()));

    let subscriber = tracing_subscriber::fmt().with_env_filter(env_filter);
    if config.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Loads a `ShardManagerConfig` from compiled-in defaults, an optional
/// TOML file, and `SHARD_MANAGER_`-prefixed environment variables, in that
/// increasing priority order.
pub struct ConfigLoader {
    toml_path: PathBuf,
}

impl ConfigLoader {
    pub fn new(toml_path: &Path) -> Self {
        Self {
            toml_path: toml_path.to_path_buf(),
        }
    }

    pub fn load(&self) -> Result<ShardManagerConfig, figment::Error> {
        Figment::from(Serialized::defaults(ShardManagerConfig::default()))
            .merge(Toml::file(&self.toml_path))
            .merge(Env::prefixed("SHARD_MANAGER_").split("__"))
            .extract()
    }
}
