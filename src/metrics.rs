//! Prometheus metrics, registered against an externally-owned `Registry`
//! (the binary mounts `/metrics`; the library only registers collectors).

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

pub struct Metrics {
    pub registered_runners: IntGauge,
    pub unassigned_shards: IntGauge,
    pub rebalance_rounds_total: IntCounter,
    pub rebalance_moves_total: IntCounter,
    pub persist_backlog: IntGauge,
    pub health_strikes_total: IntCounter,
    pub health_evictions_total: IntCounter,
}

impl Metrics {
    pub fn new(registry: &Registry) -> anyhow::Result<Self> {
        let registered_runners =
            IntGauge::new("shard_manager_registered_runners", "Currently registered runners")?;
        let unassigned_shards = IntGauge::new(
            "shard_manager_unassigned_shards",
            "Shards with no current owner",
        )?;
        let rebalance_rounds_total = IntCounter::new(
            "shard_manager_rebalance_rounds_total",
            "Rebalance rounds run since startup",
        )?;
        let rebalance_moves_total = IntCounter::new(
            "shard_manager_rebalance_moves_total",
            "Shard moves committed by rebalance rounds since startup",
        )?;
        let persist_backlog = IntGauge::new(
            "shard_manager_persist_backlog",
            "Commits awaiting durable persistence",
        )?;
        let health_strikes_total = IntCounter::new(
            "shard_manager_health_strikes_total",
            "Failed health pings recorded since startup",
        )?;
        let health_evictions_total = IntCounter::new(
            "shard_manager_health_evictions_total",
            "Runners evicted by the health prober since startup",
        )?;

        registry.register(Box::new(registered_runners.clone()))?;
        registry.register(Box::new(unassigned_shards.clone()))?;
        registry.register(Box::new(rebalance_rounds_total.clone()))?;
        registry.register(Box::new(rebalance_moves_total.clone()))?;
        registry.register(Box::new(persist_backlog.clone()))?;
        registry.register(Box::new(health_strikes_total.clone()))?;
        registry.register(Box::new(health_evictions_total.clone()))?;

        Ok(Self {
            registered_runners,
            unassigned_shards,
            rebalance_rounds_total,
            rebalance_moves_total,
            persist_backlog,
            health_strikes_total,
            health_evictions_total,
        })
    }

    /// A registry-less instance for tests and for embedding contexts that
    /// don't want to expose `/metrics`.
    pub fn standalone() -> Self {
        Self::new(&Registry::new()).expect("fresh registry never collides")
    }
}

/// A minimal `/metrics` endpoint for the binary to mount, text-encoding
/// whatever is registered against `registry`.
pub fn router(registry: Registry) -> Router {
    Router::new().route("/metrics", get(scrape)).with_state(registry)
}

async fn scrape(State(registry): State<Registry>) -> Result<String, (StatusCode, String)> {
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&metric_families, &mut buffer)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}
