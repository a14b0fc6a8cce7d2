use crate::node::{Epoch, NodeId, ServiceName};
use bytes::Bytes;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// A request submitted to an intra-group coordinator for linearized
/// execution. The payload is opaque to the reconfiguration core; the stop
/// request is distinguished because its execution is the epoch-boundary
/// event.
#[derive(Clone)]
pub struct GroupRequest {
    pub service_name: ServiceName,
    pub epoch: Epoch,
    pub payload: Bytes,
    pub is_stop: bool,
}

impl fmt::Debug for GroupRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupRequest")
            .field("service_name", &self.service_name)
            .field("epoch", &self.epoch)
            .field("payload.len()", &self.payload.len())
            .field("is_stop", &self.is_stop)
            .finish()
    }
}

/// Notice that the coordinator finished executing a submitted request.
/// `handled` is false when the group no longer existed (or was already
/// stopped) and the request was a no-op.
#[derive(Debug)]
pub struct ExecutedNotice {
    pub request: GroupRequest,
    pub handled: bool,
}

pub type ExecutedSink = mpsc::UnboundedSender<ExecutedNotice>;

/// ReplicaCoordinator is the seam to the intra-group replication engine. The
/// engine is assumed to execute submitted requests linearizably within a
/// (name, epoch) group and to produce a durable final-state checkpoint when
/// the group's stop request executes.
///
/// Execution completion arrives asynchronously on the [`ExecutedSink`] the
/// implementation was constructed with.
#[async_trait::async_trait]
pub trait ReplicaCoordinator: Send + Sync + 'static {
    async fn submit(&self, request: GroupRequest) -> Result<(), CoordinatorError>;

    /// Locally creates the (name, epoch) replica group, initialized from
    /// `initial_state`. Idempotent.
    async fn create_group(
        &self,
        name: &ServiceName,
        epoch: Epoch,
        initial_state: Bytes,
        members: BTreeSet<NodeId>,
    ) -> Result<(), CoordinatorError>;

    /// Locally deletes the replica group. The epoch's final-state
    /// checkpoint, if one was produced, survives until
    /// [`Self::delete_final_state`].
    async fn delete_group(&self, name: &ServiceName, epoch: Epoch) -> Result<(), CoordinatorError>;

    /// The durable checkpoint produced by the epoch's stop, if still
    /// retained.
    async fn final_state(&self, name: &ServiceName, epoch: Epoch) -> Option<Bytes>;

    async fn delete_final_state(&self, name: &ServiceName, epoch: Epoch);

    /// Current application state of a live group, for serving reads.
    async fn group_state(&self, name: &ServiceName, epoch: Epoch) -> Option<Bytes>;

    /// The distinguished stop request for (name, epoch).
    fn stop_request_for(&self, name: &ServiceName, epoch: Epoch) -> GroupRequest;
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("no replica group for '{name}' epoch {epoch}")]
    NoSuchGroup { name: String, epoch: u32 },
}

/// LocalCoordinator is an in-process coordinator for tests and single-process
/// demos. It executes submissions immediately and inline, which trivially
/// satisfies the linearizability assumption. The application model is a
/// last-writer-wins register: a non-empty request payload replaces the group
/// state, an empty payload is a read.
///
/// Group state lives in a [`SharedGroups`] handle. Coordinators built over
/// the same handle model members of the same replicated group: a write or
/// stop executed through any member is visible to all of them, which is the
/// guarantee a real replication engine provides.
pub struct LocalCoordinator {
    executed_sink: ExecutedSink,
    groups: SharedGroups,
}

/// The replicated-group state shared by the [`LocalCoordinator`]s of one
/// in-process cluster.
#[derive(Clone, Default)]
pub struct SharedGroups {
    inner: std::sync::Arc<Mutex<LocalGroups>>,
}

impl SharedGroups {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Default)]
struct LocalGroups {
    groups: HashMap<(ServiceName, Epoch), LocalGroup>,
    final_states: HashMap<(ServiceName, Epoch), Bytes>,
}

struct LocalGroup {
    state: Bytes,
    stopped: bool,
}

impl LocalCoordinator {
    /// A standalone coordinator with its own group state.
    pub fn new(executed_sink: ExecutedSink) -> Self {
        Self::with_groups(executed_sink, SharedGroups::new())
    }

    /// A coordinator joining the shared group state of an in-process
    /// cluster.
    pub fn with_groups(executed_sink: ExecutedSink, groups: SharedGroups) -> Self {
        LocalCoordinator {
            executed_sink,
            groups,
        }
    }

    fn notify_executed(&self, request: GroupRequest, handled: bool) {
        // The receiving actor owns the other end; if it is gone we are
        // shutting down and the notice is moot.
        let _ = self.executed_sink.send(ExecutedNotice { request, handled });
    }
}

#[async_trait::async_trait]
impl ReplicaCoordinator for LocalCoordinator {
    async fn submit(&self, request: GroupRequest) -> Result<(), CoordinatorError> {
        let handled = {
            let mut inner = self.groups.inner.lock().expect("local coordinator mutex poison");
            let group_key = (request.service_name.clone(), request.epoch);

            match inner.groups.get_mut(&group_key) {
                None => false,
                Some(group) if group.stopped => false,
                Some(group) => {
                    if request.is_stop {
                        // The stop drains (trivially, execution is inline),
                        // checkpoints, and freezes the group in one step.
                        group.stopped = true;
                        let checkpoint = group.state.clone();
                        inner.final_states.insert(group_key, checkpoint);
                    } else if !request.payload.is_empty() {
                        group.state = request.payload.clone();
                    }
                    true
                }
            }
        };

        self.notify_executed(request, handled);
        Ok(())
    }

    async fn create_group(
        &self,
        name: &ServiceName,
        epoch: Epoch,
        initial_state: Bytes,
        _members: BTreeSet<NodeId>,
    ) -> Result<(), CoordinatorError> {
        let mut inner = self.groups.inner.lock().expect("local coordinator mutex poison");
        inner
            .groups
            .entry((name.clone(), epoch))
            .or_insert(LocalGroup {
                state: initial_state,
                stopped: false,
            });
        Ok(())
    }

    async fn delete_group(&self, name: &ServiceName, epoch: Epoch) -> Result<(), CoordinatorError> {
        let mut inner = self.groups.inner.lock().expect("local coordinator mutex poison");
        inner.groups.remove(&(name.clone(), epoch));
        Ok(())
    }

    async fn final_state(&self, name: &ServiceName, epoch: Epoch) -> Option<Bytes> {
        let inner = self.groups.inner.lock().expect("local coordinator mutex poison");
        inner.final_states.get(&(name.clone(), epoch)).cloned()
    }

    async fn delete_final_state(&self, name: &ServiceName, epoch: Epoch) {
        let mut inner = self.groups.inner.lock().expect("local coordinator mutex poison");
        inner.final_states.remove(&(name.clone(), epoch));
    }

    async fn group_state(&self, name: &ServiceName, epoch: Epoch) -> Option<Bytes> {
        let inner = self.groups.inner.lock().expect("local coordinator mutex poison");
        inner
            .groups
            .get(&(name.clone(), epoch))
            .filter(|g| !g.stopped)
            .map(|g| g.state.clone())
    }

    fn stop_request_for(&self, name: &ServiceName, epoch: Epoch) -> GroupRequest {
        GroupRequest {
            service_name: name.clone(),
            epoch,
            payload: Bytes::new(),
            is_stop: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (LocalCoordinator, mpsc::UnboundedReceiver<ExecutedNotice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (LocalCoordinator::new(tx), rx)
    }

    fn svc() -> ServiceName {
        ServiceName::new("svc")
    }

    #[tokio::test]
    async fn write_then_stop_produces_checkpoint() {
        let (coordinator, mut executed) = fixture();
        let members = [NodeId::new("a1")].into_iter().collect();

        coordinator
            .create_group(&svc(), Epoch::initial(), Bytes::from_static(b"v0"), members)
            .await
            .unwrap();

        coordinator
            .submit(GroupRequest {
                service_name: svc(),
                epoch: Epoch::initial(),
                payload: Bytes::from_static(b"v1"),
                is_stop: false,
            })
            .await
            .unwrap();
        assert!(executed.recv().await.unwrap().handled);

        let stop = coordinator.stop_request_for(&svc(), Epoch::initial());
        coordinator.submit(stop).await.unwrap();
        let notice = executed.recv().await.unwrap();
        assert!(notice.handled);
        assert!(notice.request.is_stop);

        assert_eq!(
            coordinator.final_state(&svc(), Epoch::initial()).await,
            Some(Bytes::from_static(b"v1"))
        );
        // A stopped group no longer serves state.
        assert_eq!(coordinator.group_state(&svc(), Epoch::initial()).await, None);
    }

    #[tokio::test]
    async fn empty_payload_reads_without_mutating() {
        let (coordinator, mut executed) = fixture();
        let members = [NodeId::new("a1")].into_iter().collect();
        coordinator
            .create_group(&svc(), Epoch::initial(), Bytes::from_static(b"v0"), members)
            .await
            .unwrap();

        coordinator
            .submit(GroupRequest {
                service_name: svc(),
                epoch: Epoch::initial(),
                payload: Bytes::new(),
                is_stop: false,
            })
            .await
            .unwrap();
        assert!(executed.recv().await.unwrap().handled);

        assert_eq!(
            coordinator.group_state(&svc(), Epoch::initial()).await,
            Some(Bytes::from_static(b"v0"))
        );
    }

    #[tokio::test]
    async fn submit_to_missing_group_is_unhandled() {
        let (coordinator, mut executed) = fixture();

        let stop = coordinator.stop_request_for(&svc(), Epoch::new(7));
        coordinator.submit(stop).await.unwrap();

        let notice = executed.recv().await.unwrap();
        assert!(!notice.handled);
    }

    #[tokio::test]
    async fn duplicate_stop_is_unhandled_second_time() {
        let (coordinator, mut executed) = fixture();
        let members = [NodeId::new("a1")].into_iter().collect();
        coordinator
            .create_group(&svc(), Epoch::initial(), Bytes::from_static(b"v0"), members)
            .await
            .unwrap();

        let stop = coordinator.stop_request_for(&svc(), Epoch::initial());
        coordinator.submit(stop.clone()).await.unwrap();
        coordinator.submit(stop).await.unwrap();

        assert!(executed.recv().await.unwrap().handled);
        assert!(!executed.recv().await.unwrap().handled);
    }

    #[tokio::test]
    async fn shared_groups_expose_writes_and_stops_to_every_member() {
        let shared = SharedGroups::new();
        let (tx1, mut executed1) = mpsc::unbounded_channel();
        let (tx2, mut executed2) = mpsc::unbounded_channel();
        let member1 = LocalCoordinator::with_groups(tx1, shared.clone());
        let member2 = LocalCoordinator::with_groups(tx2, shared);

        let members = [NodeId::new("a1"), NodeId::new("a2")].into_iter().collect();
        member1
            .create_group(&svc(), Epoch::initial(), Bytes::from_static(b"v0"), members)
            .await
            .unwrap();

        member1
            .submit(GroupRequest {
                service_name: svc(),
                epoch: Epoch::initial(),
                payload: Bytes::from_static(b"v1"),
                is_stop: false,
            })
            .await
            .unwrap();
        assert!(executed1.recv().await.unwrap().handled);

        // The write through member1 is visible through member2.
        assert_eq!(
            member2.group_state(&svc(), Epoch::initial()).await,
            Some(Bytes::from_static(b"v1"))
        );

        // Both members submit the stop; the group stops once, and both see
        // the checkpoint afterwards.
        member2.submit(member2.stop_request_for(&svc(), Epoch::initial())).await.unwrap();
        member1.submit(member1.stop_request_for(&svc(), Epoch::initial())).await.unwrap();
        assert!(executed2.recv().await.unwrap().handled);
        assert!(!executed1.recv().await.unwrap().handled);

        assert_eq!(
            member1.final_state(&svc(), Epoch::initial()).await,
            Some(Bytes::from_static(b"v1"))
        );
        assert_eq!(
            member2.final_state(&svc(), Epoch::initial()).await,
            Some(Bytes::from_static(b"v1"))
        );
    }

    #[tokio::test]
    async fn final_state_survives_group_deletion_until_dropped() {
        let (coordinator, mut executed) = fixture();
        let members = [NodeId::new("a1")].into_iter().collect();
        coordinator
            .create_group(&svc(), Epoch::initial(), Bytes::from_static(b"v0"), members)
            .await
            .unwrap();
        let stop = coordinator.stop_request_for(&svc(), Epoch::initial());
        coordinator.submit(stop).await.unwrap();
        executed.recv().await.unwrap();

        coordinator.delete_group(&svc(), Epoch::initial()).await.unwrap();
        assert!(coordinator.final_state(&svc(), Epoch::initial()).await.is_some());

        coordinator.delete_final_state(&svc(), Epoch::initial()).await;
        assert!(coordinator.final_state(&svc(), Epoch::initial()).await.is_none());
    }
}
