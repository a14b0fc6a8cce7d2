use crate::active::{ArActorClient, AppRequestError};
use crate::grpc::grpc_regroup_app_server::{GrpcRegroupApp, GrpcRegroupAppServer};
use crate::grpc::grpc_regroup_control_server::{GrpcRegroupControl, GrpcRegroupControlServer};
use crate::grpc::grpc_regroup_node_server::{GrpcRegroupNode, GrpcRegroupNodeServer};
use crate::grpc::{
    proto_app_request_result, proto_active_replicas_result, proto_control_result, ProtoActiveReplicas,
    ProtoActiveReplicasResult, ProtoAppRequestOk, ProtoAppRequestReq, ProtoAppRequestResult, ProtoChangeReplicasReq,
    ProtoControlError, ProtoControlErrorCode, ProtoControlOk, ProtoControlResult, ProtoCreateServiceNameReq,
    ProtoDeleteServiceNameReq, ProtoDelivered, ProtoEnvelope, ProtoReconfigureNodeConfigReq,
    ProtoRequestActiveReplicasReq,
};
use crate::node::{NodeId, NodeMap, ServiceName};
use crate::reconfigurator::{ControlError, RcActorClient};
use crate::server::RpcServerShutdownSignal;
use crate::wire;
use bytes::Bytes;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

/// NodeServer is the node-to-node message dispatcher: it decodes envelopes
/// and fans them out to whichever role actors this node runs. A message for
/// a role the node does not run is dropped; the sender's retransmission will
/// find a node that does.
pub struct NodeServer {
    logger: slog::Logger,
    reconfigurator: Option<RcActorClient>,
    active_replica: Option<ArActorClient>,
}

impl NodeServer {
    pub fn new(
        logger: slog::Logger,
        reconfigurator: Option<RcActorClient>,
        active_replica: Option<ArActorClient>,
    ) -> Self {
        NodeServer {
            logger,
            reconfigurator,
            active_replica,
        }
    }
}

pub async fn run_node_server(
    logger: slog::Logger,
    node_server: NodeServer,
    socket_addr: SocketAddr,
    shutdown_signal: RpcServerShutdownSignal,
) {
    slog::info!(logger, "Node server listening on '{:?}'", socket_addr);

    let result = Server::builder()
        .add_service(GrpcRegroupNodeServer::new(node_server))
        .serve_with_shutdown(socket_addr, shutdown_signal)
        .await;

    slog::info!(logger, "Node server has exited: {:?}", result);
}

#[async_trait::async_trait]
impl GrpcRegroupNode for NodeServer {
    async fn deliver(&self, request: Request<ProtoEnvelope>) -> Result<Response<ProtoDelivered>, Status> {
        let envelope = wire::decode_envelope(request.into_inner())
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        if crate::messages::is_for_reconfigurator(&envelope.message) {
            match &self.reconfigurator {
                Some(rc) => rc.deliver(envelope).await,
                None => {
                    slog::debug!(self.logger, "Not a reconfigurator, dropping {}", envelope.message.summary());
                }
            }
        } else {
            match &self.active_replica {
                Some(ar) => ar.deliver(envelope).await,
                None => {
                    slog::debug!(self.logger, "Not an active replica, dropping {}", envelope.message.summary());
                }
            }
        }

        Ok(Response::new(ProtoDelivered {}))
    }
}

/// ControlServer exposes the client-facing control operations on a
/// reconfigurator node.
pub struct ControlServer {
    logger: slog::Logger,
    reconfigurator: RcActorClient,
    node_map: NodeMap,
    client_port_offset: u16,
}

impl ControlServer {
    pub fn new(
        logger: slog::Logger,
        reconfigurator: RcActorClient,
        node_map: NodeMap,
        client_port_offset: u16,
    ) -> Self {
        ControlServer {
            logger,
            reconfigurator,
            node_map,
            client_port_offset,
        }
    }

    fn client_facing_addrs(&self, actives: &BTreeSet<NodeId>) -> Vec<String> {
        let mut addrs = Vec::with_capacity(actives.len());
        for id in actives {
            match self.node_map.metadata(id) {
                Some(md) => addrs.push(md.client_addr(self.client_port_offset).to_string()),
                None => slog::warn!(self.logger, "Active '{}' missing from node map", id),
            }
        }
        addrs
    }
}

/// AppServer exposes application traffic on an active-replica node.
pub struct AppServer {
    logger: slog::Logger,
    active_replica: ArActorClient,
}

impl AppServer {
    pub fn new(logger: slog::Logger, active_replica: ArActorClient) -> Self {
        AppServer {
            logger,
            active_replica,
        }
    }
}

/// Runs the client-facing server: control operations if this node is a
/// reconfigurator, app traffic if it is an active replica.
pub async fn run_client_server(
    logger: slog::Logger,
    control: Option<ControlServer>,
    app: Option<AppServer>,
    socket_addr: SocketAddr,
    shutdown_signal: RpcServerShutdownSignal,
) {
    slog::info!(logger, "Client server listening on '{:?}'", socket_addr);

    let result = Server::builder()
        .add_optional_service(control.map(GrpcRegroupControlServer::new))
        .add_optional_service(app.map(GrpcRegroupAppServer::new))
        .serve_with_shutdown(socket_addr, shutdown_signal)
        .await;

    slog::info!(logger, "Client server has exited: {:?}", result);
}

#[async_trait::async_trait]
impl GrpcRegroupControl for ControlServer {
    async fn create_service_name(
        &self,
        request: Request<ProtoCreateServiceNameReq>,
    ) -> Result<Response<ProtoControlResult>, Status> {
        let req = request.into_inner();
        slog::debug!(self.logger, "ClientWire - Create '{}'", req.service_name);

        let result = self
            .reconfigurator
            .create(
                ServiceName::new(req.service_name),
                req.initial_group.into_iter().map(NodeId::new).collect(),
                Bytes::from(req.initial_state),
            )
            .await;

        Ok(Response::new(convert_control_result(result)))
    }

    async fn delete_service_name(
        &self,
        request: Request<ProtoDeleteServiceNameReq>,
    ) -> Result<Response<ProtoControlResult>, Status> {
        let req = request.into_inner();
        slog::debug!(self.logger, "ClientWire - Delete '{}'", req.service_name);

        let result = self.reconfigurator.delete(ServiceName::new(req.service_name)).await;

        Ok(Response::new(convert_control_result(result)))
    }

    async fn change_replicas(
        &self,
        request: Request<ProtoChangeReplicasReq>,
    ) -> Result<Response<ProtoControlResult>, Status> {
        let req = request.into_inner();
        slog::debug!(self.logger, "ClientWire - ChangeReplicas '{}'", req.service_name);

        let result = self
            .reconfigurator
            .change_replicas(
                ServiceName::new(req.service_name),
                req.new_group.into_iter().map(NodeId::new).collect(),
            )
            .await;

        Ok(Response::new(convert_control_result(result)))
    }

    async fn reconfigure_node_config(
        &self,
        request: Request<ProtoReconfigureNodeConfigReq>,
    ) -> Result<Response<ProtoControlResult>, Status> {
        let req = request.into_inner();
        slog::debug!(self.logger, "ClientWire - ReconfigureNodeConfig");

        let result = self
            .reconfigurator
            .reconfigure_node_config(
                req.added.into_iter().map(NodeId::new).collect(),
                req.removed.into_iter().map(NodeId::new).collect(),
            )
            .await;

        Ok(Response::new(convert_control_result(result)))
    }

    async fn request_active_replicas(
        &self,
        request: Request<ProtoRequestActiveReplicasReq>,
    ) -> Result<Response<ProtoActiveReplicasResult>, Status> {
        let req = request.into_inner();

        let result = match self.reconfigurator.request_actives(ServiceName::new(req.service_name)).await {
            Ok(view) => proto_active_replicas_result::Result::Ok(ProtoActiveReplicas {
                service_name: view.service_name.into_inner(),
                epoch_number: view.epoch.as_u32(),
                actives: self.client_facing_addrs(&view.actives),
            }),
            Err(err) => proto_active_replicas_result::Result::Err(convert_control_error(err)),
        };

        Ok(Response::new(ProtoActiveReplicasResult { result: Some(result) }))
    }
}

#[async_trait::async_trait]
impl GrpcRegroupApp for AppServer {
    async fn app_request(
        &self,
        request: Request<ProtoAppRequestReq>,
    ) -> Result<Response<ProtoAppRequestResult>, Status> {
        let req = request.into_inner();
        slog::debug!(self.logger, "ClientWire - AppRequest '{}'", req.service_name);

        let result = match self
            .active_replica
            .app_request(ServiceName::new(req.service_name), Bytes::from(req.payload))
            .await
        {
            Ok(state) => proto_app_request_result::Result::Ok(ProtoAppRequestOk {
                state: state.to_vec(),
            }),
            Err(err) => proto_app_request_result::Result::Err(convert_app_error(err)),
        };

        Ok(Response::new(ProtoAppRequestResult { result: Some(result) }))
    }
}

fn convert_control_result(result: Result<(), ControlError>) -> ProtoControlResult {
    let result = match result {
        Ok(()) => proto_control_result::Result::Ok(ProtoControlOk {}),
        Err(err) => proto_control_result::Result::Err(convert_control_error(err)),
    };
    ProtoControlResult { result: Some(result) }
}

fn convert_control_error(err: ControlError) -> ProtoControlError {
    let code = match &err {
        ControlError::NotFound(_) => ProtoControlErrorCode::NotFound,
        ControlError::AlreadyExists(_) => ProtoControlErrorCode::AlreadyExists,
        ControlError::Busy(_) => ProtoControlErrorCode::Busy,
        ControlError::InvalidConfig(_) => ProtoControlErrorCode::InvalidConfig,
        ControlError::Store(_) | ControlError::ActorExited => ProtoControlErrorCode::Unspecified,
    };
    ProtoControlError {
        code: code as i32,
        detail: err.to_string(),
    }
}

fn convert_app_error(err: AppRequestError) -> ProtoControlError {
    let code = match &err {
        AppRequestError::NotHosted(_) => ProtoControlErrorCode::NotFound,
        AppRequestError::StillStarting(_) => ProtoControlErrorCode::Busy,
        AppRequestError::ActorExited => ProtoControlErrorCode::Unspecified,
    };
    ProtoControlError {
        code: code as i32,
        detail: err.to_string(),
    }
}
