use crate::messages::{DropEpochFinalState, ReconfigMessage, StartEpoch, StopEpoch};
use crate::node::{Epoch, NodeId, ServiceName};
use bytes::Bytes;
use std::collections::BTreeSet;

/// Position of a reconfiguration record in the epoch-transition state
/// machine. READY holds iff no group change is pending.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RecordState {
    Ready,
    WaitAckStop,
    WaitAckStart,
    WaitAckDrop,
}

/// The per-name control document owned by the reconfigurator. Every mutation
/// here must be durably written before any message that reflects it is sent;
/// [`ReconfigurationRecord::desired_messages`] is derived purely from the
/// durable fields so a restarted reconfigurator resumes by re-emitting them.
#[derive(Clone, Debug)]
pub struct ReconfigurationRecord {
    pub name: ServiceName,
    pub epoch: Epoch,
    /// The replica group for `epoch`. During WaitAckStop this is still the
    /// group being stopped; the epoch bump and group swap happen together on
    /// the first stop ack.
    pub actives: BTreeSet<NodeId>,
    /// The pending group while a change awaits its stop ack. `Some(∅)` is a
    /// pending delete.
    pub new_actives: Option<BTreeSet<NodeId>>,
    pub state: RecordState,
    /// For a fresh record this carries the creation initial state; after a
    /// stop ack it carries the stopped epoch's checkpoint. Handed to the new
    /// group inline only when there is no previous group to fetch from (or
    /// the change is an identity change).
    pub stop_checkpoint: Option<Bytes>,
    /// The stopped group still owed a DropEpochFinalState, and its epoch.
    pub prev_actives: BTreeSet<NodeId>,
    pub prev_epoch: Option<Epoch>,
    /// True when the in-flight transition is a delete; the record is removed
    /// instead of returning to READY.
    pub pending_delete: bool,
}

/// What the reconfigurator should currently be retransmitting for this
/// record: message kind, targets, and the ack threshold that ends the wait.
#[derive(Debug)]
pub struct DesiredMessages {
    pub kind: WaitKind,
    pub targets: Vec<NodeId>,
    pub message: ReconfigMessage,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WaitKind {
    /// Satisfied by the first AckStopEpoch from any target.
    Stop,
    /// Satisfied by AckStartEpoch from a majority of targets.
    Start,
    /// Satisfied by AckDropEpochFinalState from every target.
    Drop,
}

impl WaitKind {
    pub fn type_name(self) -> &'static str {
        match self {
            WaitKind::Stop => "StopEpoch",
            WaitKind::Start => "StartEpoch",
            WaitKind::Drop => "DropEpochFinalState",
        }
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum RecordError {
    /// A control operation arrived while the record is mid-transition.
    Busy,
}

impl ReconfigurationRecord {
    /// Creation is modeled as epoch 0 starting from an empty previous group:
    /// the record is born in WaitAckStart with the initial state standing in
    /// for the (nonexistent) predecessor checkpoint.
    pub fn create(name: ServiceName, initial_group: BTreeSet<NodeId>, initial_state: Bytes) -> Self {
        ReconfigurationRecord {
            name,
            epoch: Epoch::initial(),
            actives: initial_group,
            new_actives: None,
            state: RecordState::WaitAckStart,
            stop_checkpoint: Some(initial_state),
            prev_actives: BTreeSet::new(),
            prev_epoch: None,
            pending_delete: false,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == RecordState::Ready
    }

    /// READY → WAIT_ACK_STOP with a pending replacement group.
    pub fn begin_change(&mut self, new_group: BTreeSet<NodeId>) -> Result<(), RecordError> {
        if !self.is_ready() {
            return Err(RecordError::Busy);
        }
        self.new_actives = Some(new_group);
        self.state = RecordState::WaitAckStop;
        Ok(())
    }

    /// READY → WAIT_ACK_STOP with an empty pending group; the record is
    /// removed once the old group confirms the drop.
    pub fn begin_delete(&mut self) -> Result<(), RecordError> {
        if !self.is_ready() {
            return Err(RecordError::Busy);
        }
        self.new_actives = Some(BTreeSet::new());
        self.pending_delete = true;
        self.state = RecordState::WaitAckStop;
        Ok(())
    }

    /// WAIT_ACK_STOP → WAIT_ACK_START (or straight to WAIT_ACK_DROP for a
    /// delete): the epoch bumps, the pending group becomes current, and the
    /// stopped group is remembered for the drop phase. Driven by the first
    /// AckStopEpoch for (name, epoch); the caller dedups the rest.
    pub fn apply_stop_acked(&mut self, checkpoint: Option<Bytes>) {
        debug_assert_eq!(self.state, RecordState::WaitAckStop);

        let new_actives = self.new_actives.take().unwrap_or_default();
        self.prev_actives = std::mem::replace(&mut self.actives, new_actives);
        self.prev_epoch = Some(self.epoch);
        self.epoch = self.epoch.next();
        self.stop_checkpoint = checkpoint;

        if self.actives.is_empty() {
            // Delete: no group to start, go collect the drops.
            self.state = RecordState::WaitAckDrop;
        } else {
            self.state = RecordState::WaitAckStart;
        }
    }

    /// WAIT_ACK_START → WAIT_ACK_DROP once a majority of the new group has
    /// acked, or straight to READY when there is no previous group to drop
    /// (creation).
    pub fn apply_start_acked(&mut self) {
        debug_assert_eq!(self.state, RecordState::WaitAckStart);

        if self.prev_actives.is_empty() {
            self.stop_checkpoint = None;
            self.state = RecordState::Ready;
        } else {
            self.state = RecordState::WaitAckDrop;
        }
    }

    /// WAIT_ACK_DROP → READY once every prior-group member has acked the
    /// drop. Returns true when the record itself should now be deleted (the
    /// transition was a delete).
    pub fn apply_drop_acked(&mut self) -> bool {
        debug_assert_eq!(self.state, RecordState::WaitAckDrop);

        self.prev_actives.clear();
        self.prev_epoch = None;
        self.stop_checkpoint = None;
        self.state = RecordState::Ready;
        self.pending_delete
    }

    /// An identity change keeps the same membership; the new epoch can be
    /// seeded inline from the stop checkpoint instead of fetching it from
    /// the (same) nodes peer-to-peer.
    fn is_identity_change(&self) -> bool {
        !self.actives.is_empty() && self.actives == self.prev_actives
    }

    /// The outbound messages this record's current state calls for, derived
    /// from durable fields only. None when READY.
    pub fn desired_messages(&self) -> Option<DesiredMessages> {
        match self.state {
            RecordState::Ready => None,
            RecordState::WaitAckStop => Some(DesiredMessages {
                kind: WaitKind::Stop,
                targets: self.actives.iter().cloned().collect(),
                message: ReconfigMessage::StopEpoch(StopEpoch {
                    service_name: self.name.clone(),
                    epoch: self.epoch,
                }),
            }),
            RecordState::WaitAckStart => {
                // Identity changes are seeded inline only when the stop
                // actually produced a checkpoint; a no-state ack falls back
                // to the peer fetch.
                let inline_state = self.prev_actives.is_empty()
                    || (self.is_identity_change() && self.stop_checkpoint.is_some());
                Some(DesiredMessages {
                    kind: WaitKind::Start,
                    targets: self.actives.iter().cloned().collect(),
                    message: ReconfigMessage::StartEpoch(StartEpoch {
                        service_name: self.name.clone(),
                        epoch: self.epoch,
                        members: self.actives.clone(),
                        prev_epoch_group: if inline_state {
                            BTreeSet::new()
                        } else {
                            self.prev_actives.clone()
                        },
                        prev_epoch: if inline_state { None } else { self.prev_epoch },
                        initial_state: if inline_state {
                            Some(self.stop_checkpoint.clone().unwrap_or_default())
                        } else {
                            None
                        },
                    }),
                })
            }
            RecordState::WaitAckDrop => {
                let prev_epoch = self.prev_epoch.unwrap_or(Epoch::initial());
                Some(DesiredMessages {
                    kind: WaitKind::Drop,
                    targets: self.prev_actives.iter().cloned().collect(),
                    message: ReconfigMessage::DropEpochFinalState(DropEpochFinalState {
                        service_name: self.name.clone(),
                        epoch: prev_epoch,
                    }),
                })
            }
        }
    }
}
