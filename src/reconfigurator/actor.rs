use crate::actor::Callback;
use crate::messages::Envelope;
use crate::node::{NodeId, ServiceName};
use crate::reconfigurator::reconfigurator::{ActivesView, ControlError, Reconfigurator};
use bytes::Bytes;
use std::collections::BTreeSet;
use tokio::sync::mpsc;

#[derive(Debug)]
pub enum Event {
    Create {
        name: ServiceName,
        initial_group: BTreeSet<NodeId>,
        initial_state: Bytes,
        callback: Callback<(), ControlError>,
    },
    Delete {
        name: ServiceName,
        callback: Callback<(), ControlError>,
    },
    ChangeReplicas {
        name: ServiceName,
        new_group: BTreeSet<NodeId>,
        callback: Callback<(), ControlError>,
    },
    NodeConfigChange {
        added: BTreeSet<NodeId>,
        removed: BTreeSet<NodeId>,
        callback: Callback<(), ControlError>,
    },
    RequestActives {
        name: ServiceName,
        callback: Callback<ActivesView, ControlError>,
    },
    /// Acks and demand reports addressed to this node's reconfigurator role.
    Protocol(Envelope),
}

#[derive(Clone)]
pub struct RcActorClient {
    sender: mpsc::Sender<Event>,
}

impl RcActorClient {
    pub fn new(queue_size: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(queue_size);
        (RcActorClient { sender: tx }, rx)
    }

    /// Completes when the record reaches READY, i.e. the whole create
    /// protocol ran; immediate errors (AlreadyExists, InvalidConfig) come
    /// back right away.
    pub async fn create(
        &self,
        name: ServiceName,
        initial_group: BTreeSet<NodeId>,
        initial_state: Bytes,
    ) -> Result<(), ControlError> {
        let (callback, rx) = Callback::new();
        self.sender
            .send(Event::Create {
                name,
                initial_group,
                initial_state,
                callback,
            })
            .await
            .map_err(|_| ControlError::ActorExited)?;
        rx.await.map_err(|_| ControlError::ActorExited)?
    }

    /// Completes when the record is gone and every old-group member dropped
    /// its state.
    pub async fn delete(&self, name: ServiceName) -> Result<(), ControlError> {
        let (callback, rx) = Callback::new();
        self.sender
            .send(Event::Delete { name, callback })
            .await
            .map_err(|_| ControlError::ActorExited)?;
        rx.await.map_err(|_| ControlError::ActorExited)?
    }

    /// Completes when the record is READY in the new epoch.
    pub async fn change_replicas(&self, name: ServiceName, new_group: BTreeSet<NodeId>) -> Result<(), ControlError> {
        let (callback, rx) = Callback::new();
        self.sender
            .send(Event::ChangeReplicas {
                name,
                new_group,
                callback,
            })
            .await
            .map_err(|_| ControlError::ActorExited)?;
        rx.await.map_err(|_| ControlError::ActorExited)?
    }

    pub async fn reconfigure_node_config(
        &self,
        added: BTreeSet<NodeId>,
        removed: BTreeSet<NodeId>,
    ) -> Result<(), ControlError> {
        let (callback, rx) = Callback::new();
        self.sender
            .send(Event::NodeConfigChange {
                added,
                removed,
                callback,
            })
            .await
            .map_err(|_| ControlError::ActorExited)?;
        rx.await.map_err(|_| ControlError::ActorExited)?
    }

    pub async fn request_actives(&self, name: ServiceName) -> Result<ActivesView, ControlError> {
        let (callback, rx) = Callback::new();
        self.sender
            .send(Event::RequestActives { name, callback })
            .await
            .map_err(|_| ControlError::ActorExited)?;
        rx.await.map_err(|_| ControlError::ActorExited)?
    }

    pub async fn deliver(&self, envelope: Envelope) {
        // Dropped ⇒ treated as message loss; retransmission repairs it.
        let _ = self.sender.send(Event::Protocol(envelope)).await;
    }
}

/// ReconfiguratorActor single-threads all record mutation by owning the
/// [`Reconfigurator`] and draining its event queue.
pub struct ReconfiguratorActor {
    logger: slog::Logger,
    receiver: mpsc::Receiver<Event>,
    reconfigurator: Reconfigurator,
}

impl ReconfiguratorActor {
    pub fn new(logger: slog::Logger, receiver: mpsc::Receiver<Event>, reconfigurator: Reconfigurator) -> Self {
        ReconfiguratorActor {
            logger,
            receiver,
            reconfigurator,
        }
    }

    pub async fn run_event_loop(mut self) {
        while let Some(event) = self.receiver.recv().await {
            slog::trace!(self.logger, "RC event: {:?}", event);
            self.handle_event(event);
        }
    }

    // Deliberately not async: record handling never waits on the network,
    // only on the (synchronous) control store.
    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Create {
                name,
                initial_group,
                initial_state,
                callback,
            } => {
                self.reconfigurator.handle_create(name, initial_group, initial_state, callback);
            }
            Event::Delete { name, callback } => {
                self.reconfigurator.handle_delete(name, callback);
            }
            Event::ChangeReplicas {
                name,
                new_group,
                callback,
            } => {
                self.reconfigurator.handle_change_replicas(name, new_group, callback);
            }
            Event::NodeConfigChange {
                added,
                removed,
                callback,
            } => {
                self.reconfigurator.handle_node_config_change(added, removed, callback);
            }
            Event::RequestActives { name, callback } => {
                self.reconfigurator.handle_request_actives(name, callback);
            }
            Event::Protocol(envelope) => {
                self.reconfigurator.handle_protocol(envelope);
            }
        }
    }
}
