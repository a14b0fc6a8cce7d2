use crate::active::{ActiveReplica, ActiveReplicaActor, ActiveReplicaConfig, ArActorClient};
use crate::api::config::{DemandProfileType, NodeOptions, NodeOptionsValidated, RecordStoreKind, SslMode};
use crate::coordinator::{ExecutedNotice, LocalCoordinator, ReplicaCoordinator, SharedGroups};
use crate::demand::{AggregateDemandProfiler, DemandPolicy, NullDemandPolicy, RequestCountPolicy};
use crate::messages::Envelope;
use crate::messenger::{GrpcMessenger, LoopbackNetwork, Messenger};
use crate::node::{InvalidNodeMap, NodeId, NodeMap, NodeMetadata, NodeRoles, ServiceName};
use crate::reconfigurator::{RcActorClient, Reconfigurator, ReconfiguratorActor, ReconfiguratorConfig};
use crate::server;
use crate::server::{AppServer, ControlServer, NodeServer, RpcServerShutdownHandle};
use crate::store::{ControlStore, MemoryControlStore};
use crate::tasks::{ProtocolTasks, RestartIntervals};
use bytes::Bytes;
use std::convert::TryFrom;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct NodeConfig {
    pub my_node_id: String,
    pub hosts: Vec<HostEntry>,
    pub logger: slog::Logger,
    pub options: NodeOptions,
}

/// One `node_id → (address, port, roles)` entry of the deployment's host
/// table.
#[derive(Clone, Debug)]
pub struct HostEntry {
    pub node_id: String,
    pub ip_addr: Ipv4Addr,
    pub port: u16,
    pub active: bool,
    pub reconfigurator: bool,
}

impl From<HostEntry> for NodeMetadata {
    fn from(entry: HostEntry) -> Self {
        NodeMetadata::new(
            NodeId::new(entry.node_id),
            entry.ip_addr,
            entry.port,
            NodeRoles {
                active: entry.active,
                reconfigurator: entry.reconfigurator,
            },
        )
    }
}

/// Live handles to a running node. Dropping the handles shuts the node's
/// servers down.
pub struct NodeHandles {
    pub reconfigurator: Option<RcActorClient>,
    pub active_replica: Option<ArActorClient>,
    _server_shutdown: Vec<RpcServerShutdownHandle>,
}

#[derive(Debug, thiserror::Error)]
pub enum NodeCreationError {
    #[error("invalid node map")]
    InvalidNodeMap(#[from] InvalidNodeMap),
    #[error("illegal options for configuring node: {0}")]
    IllegalOptions(String),
    #[error("my node ID not in the host table")]
    MeNotInHosts,
    #[error("peer address invalid: {0}")]
    PeerAddress(String),
}

/// Creates a full node serving gRPC on its server port and, per role, on its
/// client-facing port.
pub async fn try_create_node(config: NodeConfig) -> Result<NodeHandles, NodeCreationError> {
    let logger = config.logger.clone();
    let options = NodeOptionsValidated::try_from(config.options.clone())
        .map_err(|e| NodeCreationError::IllegalOptions(e.to_string()))?;
    let node_map = node_map_from_hosts(&config.hosts)?;
    let me = NodeId::new(&config.my_node_id);
    let my_md = node_map.metadata(&me).ok_or(NodeCreationError::MeNotInHosts)?.clone();

    let messenger: Arc<dyn Messenger> = Arc::new(
        GrpcMessenger::try_create(logger.clone(), &node_map)
            .map_err(|e| NodeCreationError::PeerAddress(e.to_string()))?,
    );

    let parts = create_node_parts(
        &config.my_node_id,
        node_map.clone(),
        logger.clone(),
        &options,
        messenger,
        SharedGroups::new(),
    )
    .await?;

    let mut server_shutdown = Vec::new();

    // Node-to-node dispatcher on the server port; the client-facing services
    // move to `server_port + client_port_offset` when an offset is
    // configured, otherwise everything shares one listener.
    let node_server = NodeServer::new(
        logger.new(slog::o!("Server" => "node")),
        parts.reconfigurator.clone(),
        parts.active_replica.clone(),
    );
    let control_server = parts.reconfigurator.clone().map(|rc| {
        ControlServer::new(
            logger.new(slog::o!("Server" => "control")),
            rc,
            node_map.clone(),
            options.client_port_offset,
        )
    });
    let app_server = parts
        .active_replica
        .clone()
        .filter(|_| my_md.roles().active)
        .map(|ar| AppServer::new(logger.new(slog::o!("Server" => "app")), ar));

    let (node_shutdown_handle, node_shutdown_signal) = server::shutdown_signal();
    server_shutdown.push(node_shutdown_handle);
    tokio::spawn(server::run_node_server(
        logger.clone(),
        node_server,
        my_md.server_addr(),
        node_shutdown_signal,
    ));

    let (client_shutdown_handle, client_shutdown_signal) = server::shutdown_signal();
    server_shutdown.push(client_shutdown_handle);
    tokio::spawn(server::run_client_server(
        logger.clone(),
        control_server,
        app_server,
        my_md.client_addr(options.client_port_offset),
        client_shutdown_signal,
    ));

    Ok(NodeHandles {
        reconfigurator: parts.reconfigurator,
        active_replica: parts.active_replica,
        _server_shutdown: server_shutdown,
    })
}

/// Creates a node wired to an in-process [`LoopbackNetwork`] instead of
/// gRPC, with [`SharedGroups`] standing in for the replication engine every
/// group member talks to. Multi-node tests and single-process demos use
/// this; the protocol stack above the messenger is identical.
pub async fn try_create_loopback_node(
    config: NodeConfig,
    network: &LoopbackNetwork,
    groups: &SharedGroups,
) -> Result<NodeHandles, NodeCreationError> {
    let logger = config.logger.clone();
    let options = NodeOptionsValidated::try_from(config.options.clone())
        .map_err(|e| NodeCreationError::IllegalOptions(e.to_string()))?;
    let node_map = node_map_from_hosts(&config.hosts)?;
    let me = NodeId::new(&config.my_node_id);
    if !node_map.contains(&me) {
        return Err(NodeCreationError::MeNotInHosts);
    }

    let mut incoming = network.attach(me.clone());
    let messenger: Arc<dyn Messenger> = Arc::new(network.messenger());

    let parts = create_node_parts(
        &config.my_node_id,
        node_map,
        logger.clone(),
        &options,
        messenger,
        groups.clone(),
    )
    .await?;

    let rc = parts.reconfigurator.clone();
    let ar = parts.active_replica.clone();
    let dispatch_logger = logger.clone();
    tokio::spawn(async move {
        while let Some(envelope) = incoming.recv().await {
            dispatch_envelope(&dispatch_logger, &rc, &ar, envelope).await;
        }
    });

    Ok(NodeHandles {
        reconfigurator: parts.reconfigurator,
        active_replica: parts.active_replica,
        _server_shutdown: Vec::new(),
    })
}

/// The same role-based fan-out the node gRPC server performs, for loopback
/// wiring.
async fn dispatch_envelope(
    logger: &slog::Logger,
    rc: &Option<RcActorClient>,
    ar: &Option<ArActorClient>,
    envelope: Envelope,
) {
    if crate::messages::is_for_reconfigurator(&envelope.message) {
        match rc {
            Some(rc) => rc.deliver(envelope).await,
            None => slog::debug!(logger, "Not a reconfigurator, dropping {}", envelope.message.summary()),
        }
    } else {
        match ar {
            Some(ar) => ar.deliver(envelope).await,
            None => slog::debug!(logger, "Not an active replica, dropping {}", envelope.message.summary()),
        }
    }
}

struct NodeParts {
    reconfigurator: Option<RcActorClient>,
    active_replica: Option<ArActorClient>,
}

async fn create_node_parts(
    my_node_id: &str,
    node_map: NodeMap,
    logger: slog::Logger,
    options: &NodeOptionsValidated,
    messenger: Arc<dyn Messenger>,
    groups: SharedGroups,
) -> Result<NodeParts, NodeCreationError> {
    let me = NodeId::new(my_node_id);
    let my_roles = node_map
        .metadata(&me)
        .map(|md| md.roles())
        .ok_or(NodeCreationError::MeNotInHosts)?;

    warn_unenforced_ssl(&logger, options);

    let tasks = Arc::new(ProtocolTasks::new(
        logger.new(slog::o!("Component" => "tasks")),
        me.clone(),
        messenger.clone(),
        RestartIntervals::capped_at(options.recon_timeout),
    ));
    let store: Arc<dyn ControlStore> = match options.record_store {
        RecordStoreKind::Memory => Arc::new(MemoryControlStore::new()),
    };

    // Every reconfigurator also embeds an active replica so the NODE_CONFIG
    // record can be reconfigured with the same protocol as any other name.
    let runs_active_replica = my_roles.active || my_roles.reconfigurator;

    let mut active_replica_parts = None;
    if runs_active_replica {
        let (executed_tx, executed_rx) = mpsc::unbounded_channel::<ExecutedNotice>();
        let coordinator: Arc<dyn ReplicaCoordinator> = Arc::new(LocalCoordinator::with_groups(executed_tx, groups));
        let replica = ActiveReplica::new(ActiveReplicaConfig {
            logger: logger.new(slog::o!("Role" => "AR")),
            my_node_id: me.clone(),
            node_map: node_map.clone(),
            coordinator: coordinator.clone(),
            messenger: messenger.clone(),
            tasks: tasks.clone(),
            store: store.clone(),
            profiler: AggregateDemandProfiler::new(create_demand_policy(options.demand_profile_type)),
        });
        active_replica_parts = Some((replica, executed_rx));
    }

    let mut reconfigurator_client = None;
    if my_roles.reconfigurator {
        let reconfigurator = Reconfigurator::new(ReconfiguratorConfig {
            logger: logger.new(slog::o!("Role" => "RC")),
            my_node_id: me.clone(),
            node_map: node_map.clone(),
            store: store.clone(),
            tasks: tasks.clone(),
            profiler: AggregateDemandProfiler::new(create_demand_policy(options.demand_profile_type)),
        });

        // Seed the NODE_CONFIG group on the embedded active replica; the
        // record was bootstrapped (or recovered) by the reconfigurator.
        if let Some((replica, _)) = active_replica_parts.as_mut() {
            if let Some(record) = store.read_rc_record(&ServiceName::node_config()) {
                replica
                    .seed_epoch(&ServiceName::node_config(), record.epoch, record.actives.clone(), Bytes::new())
                    .await;
            }
        }

        let (rc_client, rc_rx) = RcActorClient::new(64);
        let rc_actor = ReconfiguratorActor::new(logger.new(slog::o!("Actor" => "RC")), rc_rx, reconfigurator);
        tokio::spawn(rc_actor.run_event_loop());
        reconfigurator_client = Some(rc_client);
    }

    let mut active_replica_client = None;
    if let Some((replica, mut executed_rx)) = active_replica_parts {
        let (ar_client, ar_rx) = ArActorClient::new(64);
        let ar_actor = ActiveReplicaActor::new(logger.new(slog::o!("Actor" => "AR")), ar_rx, replica);
        tokio::spawn(ar_actor.run_event_loop());

        // Coordinator completion callbacks become actor events.
        let executed_client = ar_client.clone();
        tokio::spawn(async move {
            while let Some(notice) = executed_rx.recv().await {
                executed_client.notify_executed(notice).await;
            }
        });

        active_replica_client = Some(ar_client);
    }

    Ok(NodeParts {
        reconfigurator: reconfigurator_client,
        active_replica: active_replica_client,
    })
}

fn node_map_from_hosts(hosts: &[HostEntry]) -> Result<NodeMap, NodeCreationError> {
    let metadata = hosts.iter().cloned().map(NodeMetadata::from).collect();
    Ok(NodeMap::try_create(metadata)?)
}

fn create_demand_policy(profile_type: DemandProfileType) -> Arc<dyn DemandPolicy> {
    match profile_type {
        DemandProfileType::Null => Arc::new(NullDemandPolicy),
        DemandProfileType::RequestCount { report_every } => Arc::new(RequestCountPolicy { report_every }),
    }
}

fn warn_unenforced_ssl(logger: &slog::Logger, options: &NodeOptionsValidated) {
    if options.client_ssl_mode != SslMode::None || options.server_ssl_mode != SslMode::None {
        slog::warn!(
            logger,
            "SSL modes {:?}/{:?} accepted but not enforced; terminate TLS outside the core",
            options.client_ssl_mode,
            options.server_ssl_mode
        );
    }
}
