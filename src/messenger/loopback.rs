use crate::messages::Envelope;
use crate::messenger::{Messenger, SendError};
use crate::node::NodeId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// LoopbackNetwork routes envelopes between in-process nodes. It exists for
/// multi-node tests and single-process demos; the fault hook lets a test drop
/// selected deliveries to exercise retransmission.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    routes: HashMap<NodeId, mpsc::UnboundedSender<Envelope>>,
    fault: Option<FaultFn>,
}

/// Returns true to drop the delivery.
type FaultFn = Box<dyn Fn(&NodeId, &Envelope) -> bool + Send + Sync>;

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a node and returns the stream of envelopes addressed to it.
    pub fn attach(&self, node_id: NodeId) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .lock()
            .expect("loopback route table mutex poison")
            .routes
            .insert(node_id, tx);
        rx
    }

    pub fn messenger(&self) -> LoopbackMessenger {
        LoopbackMessenger { network: self.clone() }
    }

    /// Installs a delivery fault: the hook sees (destination, envelope) and
    /// returns true to drop that delivery.
    pub fn install_fault(&self, fault: impl Fn(&NodeId, &Envelope) -> bool + Send + Sync + 'static) {
        self.inner
            .lock()
            .expect("loopback route table mutex poison")
            .fault = Some(Box::new(fault));
    }

    pub fn clear_fault(&self) {
        self.inner
            .lock()
            .expect("loopback route table mutex poison")
            .fault = None;
    }

    fn deliver(&self, to: &NodeId, envelope: Envelope) -> Result<(), SendError> {
        let inner = self.inner.lock().expect("loopback route table mutex poison");

        if let Some(fault) = &inner.fault {
            if fault(to, &envelope) {
                // Dropped on the floor, as a lossy network would.
                return Ok(());
            }
        }

        let route = inner
            .routes
            .get(to)
            .ok_or_else(|| SendError::UnknownNode(to.clone().into_inner()))?;
        route
            .send(envelope)
            .map_err(|_| SendError::Unreachable(to.clone().into_inner()))
    }
}

#[derive(Clone)]
pub struct LoopbackMessenger {
    network: LoopbackNetwork,
}

#[async_trait::async_trait]
impl Messenger for LoopbackMessenger {
    async fn send(&self, to: &NodeId, envelope: Envelope) -> Result<(), SendError> {
        self.network.deliver(to, envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ReconfigMessage, StopEpoch};
    use crate::node::{Epoch, ServiceName};

    fn stop_envelope(sender: &str) -> Envelope {
        Envelope {
            sender: NodeId::new(sender),
            message: ReconfigMessage::StopEpoch(StopEpoch {
                service_name: ServiceName::new("svc"),
                epoch: Epoch::initial(),
            }),
        }
    }

    #[tokio::test]
    async fn routes_to_attached_node() {
        let network = LoopbackNetwork::new();
        let mut rx = network.attach(NodeId::new("a1"));
        let messenger = network.messenger();

        messenger.send(&NodeId::new("a1"), stop_envelope("rc1")).await.unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.sender, NodeId::new("rc1"));
    }

    #[tokio::test]
    async fn unknown_destination_is_an_error() {
        let network = LoopbackNetwork::new();
        let messenger = network.messenger();

        let result = messenger.send(&NodeId::new("ghost"), stop_envelope("rc1")).await;
        assert!(matches!(result, Err(SendError::UnknownNode(_))));
    }

    #[tokio::test]
    async fn fault_drops_delivery() {
        let network = LoopbackNetwork::new();
        let mut rx = network.attach(NodeId::new("a1"));
        let messenger = network.messenger();

        network.install_fault(|_, _| true);
        messenger.send(&NodeId::new("a1"), stop_envelope("rc1")).await.unwrap();

        network.clear_fault();
        messenger.send(&NodeId::new("a1"), stop_envelope("rc2")).await.unwrap();

        // Only the post-fault send arrives.
        let received = rx.recv().await.unwrap();
        assert_eq!(received.sender, NodeId::new("rc2"));
    }
}
