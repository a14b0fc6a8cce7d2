use crate::node::{Epoch, NodeId, ServiceName};
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Local lifecycle of one (name, epoch) on this node.
///
/// Starting: StartEpoch received, predecessor state still being fetched.
/// Running: replica group live under the coordinator.
/// Stopped: stop executed, checkpoint produced, group not yet deleted.
/// FinalKept: group deleted, checkpoint retained for the next group to fetch.
/// Dropped: terminal; nothing retrievable for this epoch anymore.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EpochStatus {
    Starting,
    Running,
    Stopped,
    FinalKept,
    Dropped,
}

impl EpochStatus {
    pub fn is_live(self) -> bool {
        matches!(self, EpochStatus::Starting | EpochStatus::Running)
    }

    pub fn has_checkpoint(self) -> bool {
        matches!(self, EpochStatus::Stopped | EpochStatus::FinalKept)
    }
}

#[derive(Clone, Debug)]
pub struct EpochInstance {
    pub members: BTreeSet<NodeId>,
    pub status: EpochStatus,
    /// Present iff `status.has_checkpoint()`.
    pub final_checkpoint: Option<Bytes>,
}

/// EpochTable is this node's view of every epoch it hosts or retains.
/// Dropped epochs stay as tombstones so retransmitted requests for them can
/// be answered idempotently.
#[derive(Default)]
pub struct EpochTable {
    by_name: HashMap<ServiceName, BTreeMap<Epoch, EpochInstance>>,
}

impl EpochTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &ServiceName, epoch: Epoch) -> Option<&EpochInstance> {
        self.by_name.get(name).and_then(|epochs| epochs.get(&epoch))
    }

    pub fn status(&self, name: &ServiceName, epoch: Epoch) -> Option<EpochStatus> {
        self.get(name, epoch).map(|instance| instance.status)
    }

    /// The highest epoch this node has any state for, dropped tombstones
    /// included.
    pub fn highest_epoch(&self, name: &ServiceName) -> Option<Epoch> {
        self.by_name
            .get(name)
            .and_then(|epochs| epochs.keys().next_back().copied())
    }

    /// The epoch currently live (Starting or Running) for the name, if any.
    pub fn live_epoch(&self, name: &ServiceName) -> Option<(Epoch, &EpochInstance)> {
        self.by_name.get(name).and_then(|epochs| {
            epochs
                .iter()
                .rev()
                .find(|(_, instance)| instance.status.is_live())
                .map(|(epoch, instance)| (*epoch, instance))
        })
    }

    /// Registers a new local epoch. Any lower still-live epoch is superseded:
    /// a majority of its group has moved on, so its unstopped local state has
    /// no checkpoint duty and is tombstoned.
    pub fn insert_live(
        &mut self,
        name: &ServiceName,
        epoch: Epoch,
        members: BTreeSet<NodeId>,
        status: EpochStatus,
    ) -> Vec<Epoch> {
        debug_assert!(status.is_live());
        let epochs = self.by_name.entry(name.clone()).or_default();

        let superseded: Vec<Epoch> = epochs
            .iter()
            .filter(|(e, instance)| **e < epoch && instance.status.is_live())
            .map(|(e, _)| *e)
            .collect();
        for e in &superseded {
            if let Some(instance) = epochs.get_mut(e) {
                instance.status = EpochStatus::Dropped;
                instance.final_checkpoint = None;
            }
        }

        epochs.insert(
            epoch,
            EpochInstance {
                members,
                status,
                final_checkpoint: None,
            },
        );

        superseded
    }

    pub fn set_running(&mut self, name: &ServiceName, epoch: Epoch) {
        if let Some(instance) = self.get_mut(name, epoch) {
            if instance.status == EpochStatus::Starting {
                instance.status = EpochStatus::Running;
            }
        }
    }

    /// RUNNING → STOPPED together with the checkpoint, the two being one
    /// atomic step from the protocol's point of view. A no-op on instances
    /// that already left the live states: in particular, a tombstone stays a
    /// tombstone when a late stop-execution notice races a supersession.
    pub fn mark_stopped(&mut self, name: &ServiceName, epoch: Epoch, checkpoint: Bytes) {
        if let Some(instance) = self.get_mut(name, epoch) {
            if instance.status.is_live() {
                instance.status = EpochStatus::Stopped;
                instance.final_checkpoint = Some(checkpoint);
            }
        }
    }

    /// STOPPED → FINAL_KEPT once the replica group is deleted but the
    /// checkpoint must remain fetchable.
    pub fn mark_final_kept(&mut self, name: &ServiceName, epoch: Epoch) {
        if let Some(instance) = self.get_mut(name, epoch) {
            if instance.status == EpochStatus::Stopped {
                instance.status = EpochStatus::FinalKept;
            }
        }
    }

    /// Terminal: the checkpoint is discarded and only a tombstone remains.
    pub fn mark_dropped(&mut self, name: &ServiceName, epoch: Epoch) {
        if let Some(instance) = self.get_mut(name, epoch) {
            instance.status = EpochStatus::Dropped;
            instance.final_checkpoint = None;
        }
    }

    pub fn final_checkpoint(&self, name: &ServiceName, epoch: Epoch) -> Option<Bytes> {
        self.get(name, epoch)
            .filter(|instance| instance.status.has_checkpoint())
            .and_then(|instance| instance.final_checkpoint.clone())
    }

    /// Every checkpoint still retained for the name, by epoch.
    pub fn retained_checkpoints(&self, name: &ServiceName) -> BTreeMap<Epoch, Bytes> {
        self.by_name
            .get(name)
            .map(|epochs| {
                epochs
                    .iter()
                    .filter(|(_, instance)| instance.status.has_checkpoint())
                    .filter_map(|(epoch, instance)| {
                        instance.final_checkpoint.clone().map(|checkpoint| (*epoch, checkpoint))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn get_mut(&mut self, name: &ServiceName, epoch: Epoch) -> Option<&mut EpochInstance> {
        self.by_name.get_mut(name).and_then(|epochs| epochs.get_mut(&epoch))
    }
}

/// NameRecord is the durable document for one name in the `name-records`
/// collection: the newest local epoch plus every retained checkpoint.
/// Application user fields ride along opaquely.
#[derive(Clone, Debug)]
pub struct NameRecord {
    pub name: ServiceName,
    pub epoch: Epoch,
    pub status: EpochStatus,
    pub members: BTreeSet<NodeId>,
    pub retained_checkpoints: BTreeMap<Epoch, Bytes>,
    pub user_fields: Bytes,
}
