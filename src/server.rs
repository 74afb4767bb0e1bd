use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;

use prometheus::Registry;
use tokio::net::TcpListener;
use tracing::{error, info};

use shard_manager::config::{init_tracing, ConfigLoader, SafeDisplay};
use shard_manager::health::GrpcHealthCheck;
use shard_manager::metrics::{self, Metrics};
use shard_manager::persist::{FilePersister, NoopPersister, Persister};
use shard_manager::proto;
use shard_manager::rpc::ShardManagerGrpc;
use shard_manager::ShardManager;

fn main() -> anyhow::Result<()> {
    let config_path = std::env::var("SHARD_MANAGER_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config/shard-manager.toml"));

    let config = ConfigLoader::new(&config_path).load()?;
    init_tracing(&config.tracing);

    info!("starting shard-manager with configuration:\n{}", config.to_safe_string_indented());

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(config))
}

async fn async_main(config: shard_manager::config::ShardManagerConfig) -> anyhow::Result<()> {
    let registry = Registry::new();
    let metrics = Arc::new(Metrics::new(&registry)?);

    let persister: Arc<dyn Persister> = match &config.snapshot_path {
        Some(path) => Arc::new(FilePersister::new(path.clone())),
        None => Arc::new(NoopPersister),
    };

    let mut manager = ShardManager::bootstrap(
        config.clone(),
        persister,
        Arc::new(GrpcHealthCheck),
        metrics,
    )
    .await?;

    let grpc_addr: SocketAddr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.grpc_port).into();
    let metrics_addr: SocketAddr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.metrics_port).into();

    info!(%grpc_addr, %metrics_addr, "listening");

    let grpc_server = tokio::spawn(start_grpc_server(
        grpc_addr,
        manager.events.clone(),
        manager.notifier.clone(),
        manager.clock.clone(),
    ));
    let metrics_server = tokio::spawn(start_metrics_server(metrics_addr, registry));

    let mut fatal = false;
    tokio::select! {
        result = grpc_server => {
            match result {
                Ok(Ok(())) => info!(server = "grpc", "server exited"),
                Ok(Err(e)) => error!(server = "grpc", error = %e, "server exited with an error"),
                Err(e) => error!(server = "grpc", error = %e, "server task panicked"),
            }
        }
        result = metrics_server => {
            match result {
                Ok(Ok(())) => info!(server = "metrics", "server exited"),
                Ok(Err(e)) => error!(server = "metrics", error = %e, "server exited with an error"),
                Err(e) => error!(server = "metrics", error = %e, "server task panicked"),
            }
        }
        // An invariant violation is fatal. The control loop task exiting
        // with `Err` before either transport listener has stopped means the
        // manager must stop accepting events and exit; a supervisor is
        // expected to restart it.
        result = manager.control_loop_handle() => {
            if let Ok(Err(err)) = result {
                error!(reason = %err, "control loop exited after an invariant violation");
            }
            fatal = true;
        }
    }

    manager.shutdown().await;
    if fatal {
        anyhow::bail!("shard manager control loop halted on an invariant violation");
    }
    Ok(())
}

async fn start_grpc_server(
    addr: SocketAddr,
    events: shard_manager::control::EventSender,
    notifier: Arc<shard_manager::notify::Notifier>,
    clock: Arc<dyn shard_manager::clock::Clock>,
) -> Result<(), tonic::transport::Error> {
    let (mut health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<proto::shard_manager_server::ShardManagerServer<ShardManagerGrpc>>()
        .await;

    let reflection_service = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(proto::FILE_DESCRIPTOR_SET)
        .build_v1()
        .expect("reflection service descriptor is valid");

    let grpc_service = proto::shard_manager_server::ShardManagerServer::new(ShardManagerGrpc::new(
        events, notifier, clock,
    ));

    tonic::transport::Server::builder()
        .add_service(reflection_service)
        .add_service(health_service)
        .add_service(grpc_service)
        .serve(addr)
        .await
}

async fn start_metrics_server(addr: SocketAddr, registry: Registry) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, metrics::router(registry)).await
}
