use crate::node::{Epoch, NodeId, ServiceName};
use bytes::Bytes;
use std::collections::BTreeSet;
use std::fmt;

/// Envelope pairs a protocol message with the node that sent it. Replies go
/// back to `sender`; dedup is on the message's (name, epoch) plus `sender`.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub sender: NodeId,
    pub message: ReconfigMessage,
}

/// The node-to-node protocol messages, one variant per wire type. Requests
/// originate at a reconfigurator (stop/start/drop) or an active replica
/// (final-state fetch, demand report); acks are ordinary messages in the
/// reverse direction, deduplicated by the receiver.
#[derive(Clone, Debug)]
pub enum ReconfigMessage {
    StopEpoch(StopEpoch),
    AckStopEpoch(AckStopEpoch),
    StartEpoch(StartEpoch),
    AckStartEpoch(AckStartEpoch),
    DropEpochFinalState(DropEpochFinalState),
    AckDropEpochFinalState(AckDropEpochFinalState),
    RequestEpochFinalState(RequestEpochFinalState),
    EpochFinalState(EpochFinalState),
    DemandReport(DemandReport),
}

impl ReconfigMessage {
    pub fn service_name(&self) -> &ServiceName {
        match self {
            ReconfigMessage::StopEpoch(m) => &m.service_name,
            ReconfigMessage::AckStopEpoch(m) => &m.service_name,
            ReconfigMessage::StartEpoch(m) => &m.service_name,
            ReconfigMessage::AckStartEpoch(m) => &m.service_name,
            ReconfigMessage::DropEpochFinalState(m) => &m.service_name,
            ReconfigMessage::AckDropEpochFinalState(m) => &m.service_name,
            ReconfigMessage::RequestEpochFinalState(m) => &m.service_name,
            ReconfigMessage::EpochFinalState(m) => &m.service_name,
            ReconfigMessage::DemandReport(m) => &m.service_name,
        }
    }

    pub fn epoch(&self) -> Epoch {
        match self {
            ReconfigMessage::StopEpoch(m) => m.epoch,
            ReconfigMessage::AckStopEpoch(m) => m.epoch,
            ReconfigMessage::StartEpoch(m) => m.epoch,
            ReconfigMessage::AckStartEpoch(m) => m.epoch,
            ReconfigMessage::DropEpochFinalState(m) => m.epoch,
            ReconfigMessage::AckDropEpochFinalState(m) => m.epoch,
            ReconfigMessage::RequestEpochFinalState(m) => m.epoch,
            ReconfigMessage::EpochFinalState(m) => m.epoch,
            ReconfigMessage::DemandReport(m) => m.epoch,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ReconfigMessage::StopEpoch(_) => "StopEpoch",
            ReconfigMessage::AckStopEpoch(_) => "AckStopEpoch",
            ReconfigMessage::StartEpoch(_) => "StartEpoch",
            ReconfigMessage::AckStartEpoch(_) => "AckStartEpoch",
            ReconfigMessage::DropEpochFinalState(_) => "DropEpochFinalState",
            ReconfigMessage::AckDropEpochFinalState(_) => "AckDropEpochFinalState",
            ReconfigMessage::RequestEpochFinalState(_) => "RequestEpochFinalState",
            ReconfigMessage::EpochFinalState(_) => "EpochFinalState",
            ReconfigMessage::DemandReport(_) => "DemandReport",
        }
    }

    /// Short form for logs, `Type:name:epoch`.
    pub fn summary(&self) -> String {
        format!("{}:{}:{}", self.type_name(), self.service_name(), self.epoch())
    }
}

/// Routing predicate for the per-node dispatcher: acks and demand reports go
/// to the reconfigurator role, everything else to the active-replica role.
pub fn is_for_reconfigurator(message: &ReconfigMessage) -> bool {
    matches!(
        message,
        ReconfigMessage::AckStopEpoch(_)
            | ReconfigMessage::AckStartEpoch(_)
            | ReconfigMessage::AckDropEpochFinalState(_)
            | ReconfigMessage::DemandReport(_)
    )
}

#[derive(Clone, Debug)]
pub struct StopEpoch {
    pub service_name: ServiceName,
    pub epoch: Epoch,
}

#[derive(Clone, Debug)]
pub struct AckStopEpoch {
    pub service_name: ServiceName,
    pub epoch: Epoch,
    /// Absent when the acking replica never held the epoch or has already
    /// dropped it.
    pub final_state: Option<Bytes>,
}

#[derive(Clone)]
pub struct StartEpoch {
    pub service_name: ServiceName,
    pub epoch: Epoch,
    pub members: BTreeSet<NodeId>,
    /// Empty for creation: the new epoch starts from `initial_state` instead
    /// of fetching a predecessor checkpoint.
    pub prev_epoch_group: BTreeSet<NodeId>,
    pub prev_epoch: Option<Epoch>,
    pub initial_state: Option<Bytes>,
}

impl fmt::Debug for StartEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartEpoch")
            .field("service_name", &self.service_name)
            .field("epoch", &self.epoch)
            .field("members", &self.members)
            .field("prev_epoch_group", &self.prev_epoch_group)
            .field("prev_epoch", &self.prev_epoch)
            .field("initial_state.len()", &self.initial_state.as_ref().map(Bytes::len))
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct AckStartEpoch {
    pub service_name: ServiceName,
    pub epoch: Epoch,
}

#[derive(Clone, Debug)]
pub struct DropEpochFinalState {
    pub service_name: ServiceName,
    pub epoch: Epoch,
}

#[derive(Clone, Debug)]
pub struct AckDropEpochFinalState {
    pub service_name: ServiceName,
    pub epoch: Epoch,
}

#[derive(Clone, Debug)]
pub struct RequestEpochFinalState {
    pub service_name: ServiceName,
    pub epoch: Epoch,
}

#[derive(Clone)]
pub struct EpochFinalState {
    pub service_name: ServiceName,
    pub epoch: Epoch,
    pub final_state: Bytes,
}

impl fmt::Debug for EpochFinalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EpochFinalState")
            .field("service_name", &self.service_name)
            .field("epoch", &self.epoch)
            .field("final_state.len()", &self.final_state.len())
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct DemandReport {
    pub service_name: ServiceName,
    /// Useful for debugging only; the record's own epoch is authoritative.
    pub epoch: Epoch,
    pub profile: Bytes,
}
