//! The concrete `tonic` binding for the runner-facing command API. The core
//! (`control`, `store`, `engine`, ...) stays transport-agnostic; this module
//! is the only place that knows about `proto` types.

use std::pin::Pin;

use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status};
use tracing::{info, warn};

use crate::clock::Clock;
use crate::control::EventSender;
use crate::error::ManagerError;
use crate::model::{RunnerAddress, RunnerVersion};
use crate::notify::{Notification, Notifier};
use crate::proto;
use std::sync::Arc;

pub struct ShardManagerGrpc {
    events: EventSender,
    notifier: Arc<Notifier>,
    clock: Arc<dyn Clock>,
}

impl ShardManagerGrpc {
    pub fn new(events: EventSender, notifier: Arc<Notifier>, clock: Arc<dyn Clock>) -> Self {
        Self {
            events,
            notifier,
            clock,
        }
    }
}

#[async_trait::async_trait]
impl proto::shard_manager_server::ShardManager for ShardManagerGrpc {
    async fn register(
        &self,
        request: Request<proto::RegisterRequest>,
    ) -> Result<Response<proto::RegisterResponse>, Status> {
        let req = request.into_inner();
        let address = require_address(req.address)?;
        let version = RunnerVersion(req.version);
        let now = self.clock.now();

        // The control loop itself opens the runner's notification channel
        // as part of handling `Event::Register` (control.rs); this handler
        // only needs the outcome for the RPC response and log line.
        self.events.register(address.clone(), version, now).await.map_err(status_from_error)?;
        info!(runner = %address, version = version.0, "runner registered");
        Ok(Response::new(proto::RegisterResponse {}))
    }

    async fn unregister(
        &self,
        request: Request<proto::UnregisterRequest>,
    ) -> Result<Response<proto::UnregisterResponse>, Status> {
        let address = require_address(request.into_inner().address)?;
        self.events.unregister(address.clone()).await.map_err(status_from_error)?;
        info!(runner = %address, "runner unregistered");
        Ok(Response::new(proto::UnregisterResponse {}))
    }

    async fn heartbeat(
        &self,
        request: Request<proto::HeartbeatRequest>,
    ) -> Result<Response<proto::HeartbeatResponse>, Status> {
        let address = require_address(request.into_inner().address)?;
        let now = self.clock.now();
        self.events.heartbeat(address, now).await.map_err(status_from_error)?;
        Ok(Response::new(proto::HeartbeatResponse {}))
    }

    async fn get_assignments(
        &self,
        _request: Request<proto::GetAssignmentsRequest>,
    ) -> Result<Response<proto::GetAssignmentsResponse>, Status> {
        let assignments = self.events.get_assignments().await;
        let assignments = assignments
            .into_iter()
            .map(|(shard, owner)| proto::ShardOwner {
                shard_id: shard.0,
                owner: owner.runner().map(address_to_proto),
            })
            .collect();
        Ok(Response::new(proto::GetAssignmentsResponse { assignments }))
    }

    type NotificationsStream = Pin<Box<dyn Stream<Item = Result<proto::AssignmentDelta, Status>> + Send + 'static>>;

    async fn notifications(
        &self,
        request: Request<proto::NotificationsRequest>,
    ) -> Result<Response<Self::NotificationsStream>, Status> {
        let address = require_address(request.into_inner().address)?;
        let rx = self.notifier.take_stream(&address).ok_or_else(|| {
            Status::failed_precondition(format!(
                "{address} has no claimable notification stream; register first"
            ))
        })?;

        let stream = ReceiverStream::new(rx).map(|notification| Ok(notification_to_proto(notification)));
        Ok(Response::new(Box::pin(stream)))
    }
}

fn notification_to_proto(notification: Notification) -> proto::AssignmentDelta {
    match notification {
        Notification::Full(shards) => proto::AssignmentDelta {
            added: shards.into_iter().map(|s| s.0).collect(),
            removed: Vec::new(),
        },
        Notification::Delta(delta) => proto::AssignmentDelta {
            added: delta.added.into_iter().map(|s| s.0).collect(),
            removed: delta.removed.into_iter().map(|s| s.0).collect(),
        },
    }
}

fn address_to_proto(address: &RunnerAddress) -> proto::RunnerAddress {
    proto::RunnerAddress {
        host: address.host.clone(),
        port: address.port as u32,
    }
}

fn require_address(address: Option<proto::RunnerAddress>) -> Result<RunnerAddress, Status> {
    let address = address.ok_or_else(|| Status::invalid_argument("missing address"))?;
    let port: u16 = address
        .port
        .try_into()
        .map_err(|_| Status::invalid_argument(format!("port {} out of range", address.port)))?;
    Ok(RunnerAddress {
        host: address.host,
        port,
    })
}

fn status_from_error(err: ManagerError) -> Status {
    match &err {
        ManagerError::ClientMisuse { reason } => Status::failed_precondition(reason.clone()),
        ManagerError::Transient { reason, .. } => Status::unavailable(reason.clone()),
        ManagerError::Persistence { reason } => Status::unavailable(reason.clone()),
        ManagerError::Invariant { reason } => {
            warn!(reason, "invariant violation surfaced to a runner-facing RPC");
            Status::internal(reason.clone())
        }
    }
}
