use crate::grpc::grpc_regroup_node_client::GrpcRegroupNodeClient;
use crate::messages::Envelope;
use crate::messenger::{Messenger, SendError};
use crate::node::{NodeId, NodeMap};
use crate::wire;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use tokio::sync::Mutex;
use tonic::codegen::http::uri;
use tonic::transport::{Channel, Endpoint, Uri};

/// GrpcMessenger delivers envelopes over the node-to-node tonic service.
/// Peer connections are established lazily so a node can start before its
/// peers are reachable; a failed send flips the peer back to Disconnected and
/// the next retransmission retries the connect.
pub struct GrpcMessenger {
    logger: slog::Logger,
    peers: HashMap<NodeId, Mutex<Peer>>,
}

struct Peer {
    endpoint: Endpoint,
    conn: Conn,
}

enum Conn {
    Connected(GrpcRegroupNodeClient<Channel>),
    Disconnected,
}

impl GrpcMessenger {
    pub fn try_create(logger: slog::Logger, node_map: &NodeMap) -> Result<Self, uri::InvalidUri> {
        let mut peers = HashMap::new();
        for md in node_map.iter() {
            let endpoint = Endpoint::from(Self::make_uri(md.ip_addr(), md.server_port())?);
            peers.insert(
                md.node_id().clone(),
                Mutex::new(Peer {
                    endpoint,
                    conn: Conn::Disconnected,
                }),
            );
        }

        Ok(GrpcMessenger { logger, peers })
    }

    fn make_uri(ip: Ipv4Addr, port: u16) -> Result<Uri, uri::InvalidUri> {
        let ip_octets = ip.octets();
        let url = format!(
            "http://{}.{}.{}.{}:{}",
            ip_octets[0], ip_octets[1], ip_octets[2], ip_octets[3], port
        );
        Uri::from_maybe_shared(url)
    }
}

impl Peer {
    async fn try_reconnect_if_needed(&mut self, logger: &slog::Logger) {
        if let Conn::Disconnected = self.conn {
            match self.endpoint.connect().await {
                Ok(channel) => {
                    slog::debug!(logger, "Connected to {:?}", self.endpoint.uri());
                    self.conn = Conn::Connected(GrpcRegroupNodeClient::new(channel));
                }
                Err(conn_err) => {
                    slog::debug!(logger, "Failed to connect to {:?} - {:?}", self.endpoint.uri(), conn_err);
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Messenger for GrpcMessenger {
    async fn send(&self, to: &NodeId, envelope: Envelope) -> Result<(), SendError> {
        let peer = self
            .peers
            .get(to)
            .ok_or_else(|| SendError::UnknownNode(to.clone().into_inner()))?;

        let mut peer = peer.lock().await;
        peer.try_reconnect_if_needed(&self.logger).await;

        if let Conn::Connected(client) = &mut peer.conn {
            match client.deliver(wire::encode_envelope(envelope)).await {
                Ok(_) => return Ok(()),
                Err(status) => {
                    slog::debug!(self.logger, "Deliver to {:?} failed: {:?}", to, status);
                    peer.conn = Conn::Disconnected;
                }
            }
        }

        Err(SendError::Unreachable(to.clone().into_inner()))
    }
}
