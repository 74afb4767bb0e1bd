//! Health prober: an independent task that periodically scans the store
//! for silent runners, pings them with bounded concurrency, and injects
//! the result back into the control loop as ordinary events. It never
//! mutates the store directly, preserving the single-writer discipline
//! the rest of the manager relies on.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::info;

use crate::clock::Clock;
use crate::config::ShardManagerConfig;
use crate::control::EventSender;
use crate::model::RunnerAddress;
use crate::store::StateStore;

/// Abstracts the actual liveness check so tests can substitute a fake
/// that fails on command instead of dialing a real runner.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn ping(&self, address: &RunnerAddress, timeout: Duration) -> bool;
}

pub struct HealthProber<H: HealthCheck> {
    check: Arc<H>,
    store: Arc<StateStore>,
    events: EventSender,
    clock: Arc<dyn Clock>,
    config: ShardManagerConfig,
}

impl<H: HealthCheck + 'static> HealthProber<H> {
    pub fn new(
        check: Arc<H>,
        store: Arc<StateStore>,
        events: EventSender,
        clock: Arc<dyn Clock>,
        config: ShardManagerConfig,
    ) -> Self {
        Self {
            check,
            store,
            events,
            clock,
            config,
        }
    }

    /// Runs forever, waking every `health_tick_interval`. Intended to be
    /// spawned as its own task; cancel by dropping the `JoinHandle`.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.config.health_tick_interval);
        loop {
            ticker.tick().await;
            self.sweep().await;
            self.events.notify_tick();
        }
    }

    async fn sweep(&self) {
        let now = self.clock.now();
        let stale: Vec<RunnerAddress> = self
            .store
            .all_runners()
            .into_iter()
            .filter(|r| {
                now.signed_duration_since(r.last_heartbeat)
                    >= chrono::Duration::from_std(self.config.liveness_threshold).unwrap_or_default()
            })
            .map(|r| r.address)
            .collect();

        if stale.is_empty() {
            return;
        }

        let semaphore = Arc::new(Semaphore::new(self.config.probe_concurrency.max(1)));
        let mut handles = Vec::with_capacity(stale.len());

        for address in stale {
            let semaphore = semaphore.clone();
            let check = self.check.clone();
            let timeout = self.config.ping_timeout;
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
                let alive = check.ping(&address, timeout).await;
                (address, alive)
            }));
        }

        for handle in handles {
            let Ok((address, alive)) = handle.await else {
                continue;
            };
            if alive {
                info!(runner = %address, "health ping succeeded");
            } else {
                info!(runner = %address, "health ping failed");
            }
            self.events.notify_ping_result(address, alive);
        }
    }
}

/// Concrete binding for the abstract ping contract: dials the
/// runner over the standard gRPC health-checking protocol it is expected to
/// expose, the same protocol this manager's own gRPC server answers for its
/// own liveness. A fresh channel is opened per ping; the manager only
/// contacts a given runner once every `liveness_threshold` at most, so
/// connection reuse buys little here.
#[derive(Debug, Default, Clone, Copy)]
pub struct GrpcHealthCheck;

#[async_trait]
impl HealthCheck for GrpcHealthCheck {
    async fn ping(&self, address: &RunnerAddress, timeout: Duration) -> bool {
        let uri = format!("http://{}:{}", address.host, address.port);
        let Ok(endpoint) = tonic::transport::Endpoint::from_shared(uri) else {
            return false;
        };
        let endpoint = endpoint.connect_timeout(timeout);

        let channel = match tokio::time::timeout(timeout, endpoint.connect()).await {
            Ok(Ok(channel)) => channel,
            _ => return false,
        };

        let mut client = tonic_health::pb::health_client::HealthClient::new(channel);
        let request = tonic::Request::new(tonic_health::pb::HealthCheckRequest {
            service: String::new(),
        });

        match tokio::time::timeout(timeout, client.check(request)).await {
            Ok(Ok(response)) => {
                response.into_inner().status
                    == tonic_health::pb::health_check_response::ServingStatus::Serving as i32
            }
            _ => false,
        }
    }
}
