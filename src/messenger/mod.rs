mod grpc;
mod loopback;

pub use grpc::GrpcMessenger;
pub use loopback::LoopbackMessenger;
pub use loopback::LoopbackNetwork;

use crate::messages::Envelope;
use crate::node::NodeId;

/// Messenger delivers protocol envelopes to other nodes. Delivery is at-most-
/// once and unordered; the protocol layers above repair loss by
/// retransmission, so a send failure is only worth a log line.
#[async_trait::async_trait]
pub trait Messenger: Send + Sync + 'static {
    async fn send(&self, to: &NodeId, envelope: Envelope) -> Result<(), SendError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("no route to node '{0}'")]
    UnknownNode(String),
    #[error("node '{0}' unreachable")]
    Unreachable(String),
}
