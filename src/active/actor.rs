use crate::active::active::{ActiveReplica, AppRequestError};
use crate::actor::Callback;
use crate::coordinator::ExecutedNotice;
use crate::messages::Envelope;
use crate::node::ServiceName;
use bytes::Bytes;
use tokio::sync::mpsc;

#[derive(Debug)]
pub enum Event {
    /// A protocol envelope addressed to this node's active-replica role.
    Protocol(Envelope),
    /// The coordinator finished executing a submitted request.
    Executed(ExecutedNotice),
    /// An application request from a client, answered with the group state
    /// after execution.
    AppRequest(ServiceName, Bytes, Callback<Bytes, AppRequestError>),
}

#[derive(Clone)]
pub struct ArActorClient {
    sender: mpsc::Sender<Event>,
}

impl ArActorClient {
    pub fn new(queue_size: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(queue_size);
        (ArActorClient { sender: tx }, rx)
    }

    pub async fn deliver(&self, envelope: Envelope) {
        // A dropped protocol message is indistinguishable from network loss
        // and is repaired the same way, by retransmission.
        let _ = self.sender.send(Event::Protocol(envelope)).await;
    }

    pub async fn notify_executed(&self, notice: ExecutedNotice) {
        let _ = self.sender.send(Event::Executed(notice)).await;
    }

    pub async fn app_request(&self, name: ServiceName, payload: Bytes) -> Result<Bytes, AppRequestError> {
        let (callback, rx) = Callback::new();
        self.sender
            .send(Event::AppRequest(name, payload, callback))
            .await
            .map_err(|_| AppRequestError::ActorExited)?;

        rx.await.map_err(|_| AppRequestError::ActorExited)?
    }
}

/// ActiveReplicaActor single-threads all mutation of the local epoch table by
/// owning the [`ActiveReplica`] and draining its event queue.
pub struct ActiveReplicaActor {
    logger: slog::Logger,
    receiver: mpsc::Receiver<Event>,
    replica: ActiveReplica,
}

impl ActiveReplicaActor {
    pub fn new(logger: slog::Logger, receiver: mpsc::Receiver<Event>, replica: ActiveReplica) -> Self {
        ActiveReplicaActor {
            logger,
            receiver,
            replica,
        }
    }

    pub async fn run_event_loop(mut self) {
        while let Some(event) = self.receiver.recv().await {
            slog::trace!(self.logger, "AR event: {:?}", event);
            self.handle_event(event).await;
        }
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Protocol(envelope) => {
                self.replica.handle_protocol(envelope).await;
            }
            Event::Executed(notice) => {
                self.replica.handle_executed(notice).await;
            }
            Event::AppRequest(name, payload, callback) => {
                let result = self.replica.handle_app_request(name, payload).await;
                callback.send(result);
            }
        }
    }
}
