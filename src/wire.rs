//! Conversions between the in-process message types and the prost-generated
//! wire types. Encoding is infallible; decoding validates the envelope.

use crate::grpc::proto_envelope::Payload;
use crate::grpc::{
    ProtoAckDropEpochFinalState, ProtoAckStartEpoch, ProtoAckStopEpoch, ProtoDemandReport, ProtoDropEpochFinalState,
    ProtoEnvelope, ProtoEpochFinalState, ProtoRequestEpochFinalState, ProtoStartEpoch, ProtoStopEpoch,
};
use crate::messages::{
    AckDropEpochFinalState, AckStartEpoch, AckStopEpoch, DemandReport, DropEpochFinalState, Envelope, EpochFinalState,
    ReconfigMessage, RequestEpochFinalState, StartEpoch, StopEpoch,
};
use crate::node::{Epoch, NodeId, ServiceName};
use bytes::Bytes;

pub fn encode_envelope(envelope: Envelope) -> ProtoEnvelope {
    let payload = match envelope.message {
        ReconfigMessage::StopEpoch(m) => Payload::StopEpoch(ProtoStopEpoch {
            service_name: m.service_name.into_inner(),
            epoch_number: m.epoch.as_u32(),
        }),
        ReconfigMessage::AckStopEpoch(m) => Payload::AckStopEpoch(ProtoAckStopEpoch {
            service_name: m.service_name.into_inner(),
            epoch_number: m.epoch.as_u32(),
            has_final_state: m.final_state.is_some(),
            final_state: m.final_state.map(|b| b.to_vec()).unwrap_or_default(),
        }),
        ReconfigMessage::StartEpoch(m) => Payload::StartEpoch(ProtoStartEpoch {
            service_name: m.service_name.into_inner(),
            epoch_number: m.epoch.as_u32(),
            members: m.members.into_iter().map(NodeId::into_inner).collect(),
            prev_epoch_group: m.prev_epoch_group.into_iter().map(NodeId::into_inner).collect(),
            prev_epoch_number: m.prev_epoch.map(Epoch::as_u32).unwrap_or(0),
            has_initial_state: m.initial_state.is_some(),
            initial_state: m.initial_state.map(|b| b.to_vec()).unwrap_or_default(),
        }),
        ReconfigMessage::AckStartEpoch(m) => Payload::AckStartEpoch(ProtoAckStartEpoch {
            service_name: m.service_name.into_inner(),
            epoch_number: m.epoch.as_u32(),
        }),
        ReconfigMessage::DropEpochFinalState(m) => Payload::DropEpochFinalState(ProtoDropEpochFinalState {
            service_name: m.service_name.into_inner(),
            epoch_number: m.epoch.as_u32(),
        }),
        ReconfigMessage::AckDropEpochFinalState(m) => Payload::AckDropEpochFinalState(ProtoAckDropEpochFinalState {
            service_name: m.service_name.into_inner(),
            epoch_number: m.epoch.as_u32(),
        }),
        ReconfigMessage::RequestEpochFinalState(m) => Payload::RequestEpochFinalState(ProtoRequestEpochFinalState {
            service_name: m.service_name.into_inner(),
            epoch_number: m.epoch.as_u32(),
        }),
        ReconfigMessage::EpochFinalState(m) => Payload::EpochFinalState(ProtoEpochFinalState {
            service_name: m.service_name.into_inner(),
            epoch_number: m.epoch.as_u32(),
            final_state: m.final_state.to_vec(),
        }),
        ReconfigMessage::DemandReport(m) => Payload::DemandReport(ProtoDemandReport {
            service_name: m.service_name.into_inner(),
            epoch_number: m.epoch.as_u32(),
            profile: m.profile.to_vec(),
        }),
    };

    ProtoEnvelope {
        sender_node_id: envelope.sender.into_inner(),
        payload: Some(payload),
    }
}

pub fn decode_envelope(proto: ProtoEnvelope) -> Result<Envelope, DecodeError> {
    let sender = NodeId::new(proto.sender_node_id);
    let payload = proto.payload.ok_or(DecodeError::MissingPayload)?;

    let message = match payload {
        Payload::StopEpoch(m) => ReconfigMessage::StopEpoch(StopEpoch {
            service_name: ServiceName::new(m.service_name),
            epoch: Epoch::new(m.epoch_number),
        }),
        Payload::AckStopEpoch(m) => ReconfigMessage::AckStopEpoch(AckStopEpoch {
            service_name: ServiceName::new(m.service_name),
            epoch: Epoch::new(m.epoch_number),
            final_state: m.has_final_state.then(|| Bytes::from(m.final_state)),
        }),
        Payload::StartEpoch(m) => {
            let prev_epoch_group: std::collections::BTreeSet<NodeId> =
                m.prev_epoch_group.into_iter().map(NodeId::new).collect();
            // A start with no predecessor group is a creation; prev_epoch is
            // only meaningful when there is a group to fetch from.
            let prev_epoch = (!prev_epoch_group.is_empty()).then(|| Epoch::new(m.prev_epoch_number));
            ReconfigMessage::StartEpoch(StartEpoch {
                service_name: ServiceName::new(m.service_name),
                epoch: Epoch::new(m.epoch_number),
                members: m.members.into_iter().map(NodeId::new).collect(),
                prev_epoch_group,
                prev_epoch,
                initial_state: m.has_initial_state.then(|| Bytes::from(m.initial_state)),
            })
        }
        Payload::AckStartEpoch(m) => ReconfigMessage::AckStartEpoch(AckStartEpoch {
            service_name: ServiceName::new(m.service_name),
            epoch: Epoch::new(m.epoch_number),
        }),
        Payload::DropEpochFinalState(m) => ReconfigMessage::DropEpochFinalState(DropEpochFinalState {
            service_name: ServiceName::new(m.service_name),
            epoch: Epoch::new(m.epoch_number),
        }),
        Payload::AckDropEpochFinalState(m) => ReconfigMessage::AckDropEpochFinalState(AckDropEpochFinalState {
            service_name: ServiceName::new(m.service_name),
            epoch: Epoch::new(m.epoch_number),
        }),
        Payload::RequestEpochFinalState(m) => ReconfigMessage::RequestEpochFinalState(RequestEpochFinalState {
            service_name: ServiceName::new(m.service_name),
            epoch: Epoch::new(m.epoch_number),
        }),
        Payload::EpochFinalState(m) => ReconfigMessage::EpochFinalState(EpochFinalState {
            service_name: ServiceName::new(m.service_name),
            epoch: Epoch::new(m.epoch_number),
            final_state: Bytes::from(m.final_state),
        }),
        Payload::DemandReport(m) => ReconfigMessage::DemandReport(DemandReport {
            service_name: ServiceName::new(m.service_name),
            epoch: Epoch::new(m.epoch_number),
            profile: Bytes::from(m.profile),
        }),
    };

    Ok(Envelope { sender, message })
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("envelope has no payload")]
    MissingPayload,
}
