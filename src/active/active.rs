use crate::active::epochs::{EpochStatus, EpochTable, NameRecord};
use crate::coordinator::{ExecutedNotice, GroupRequest, ReplicaCoordinator};
use crate::demand::AggregateDemandProfiler;
use crate::messages::{
    AckDropEpochFinalState, AckStartEpoch, AckStopEpoch, DemandReport, DropEpochFinalState, Envelope, EpochFinalState,
    ReconfigMessage, RequestEpochFinalState, StartEpoch, StopEpoch,
};
use crate::messenger::Messenger;
use crate::node::{Epoch, NodeId, NodeMap, ServiceName};
use crate::tasks::{task_key, ProtocolTasks};
use bytes::Bytes;
use rand::seq::IteratorRandom;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// How many app requests between opportunistic trims of the demand profiler.
const DEMAND_TRIM_STRIDE: u64 = 256;

pub struct ActiveReplicaConfig {
    pub logger: slog::Logger,
    pub my_node_id: NodeId,
    pub node_map: NodeMap,
    pub coordinator: Arc<dyn ReplicaCoordinator>,
    pub messenger: Arc<dyn Messenger>,
    pub tasks: Arc<ProtocolTasks>,
    pub store: Arc<dyn crate::store::ControlStore>,
    pub profiler: AggregateDemandProfiler,
}

/// ActiveReplica hosts epochs of names on this node. It handles the four
/// reconfigurator-driven requests plus the peer-to-peer final-state exchange,
/// all idempotent on (name, epoch), and feeds every application request
/// through the intra-group coordinator.
pub struct ActiveReplica {
    logger: slog::Logger,
    my_node_id: NodeId,
    node_map: NodeMap,
    coordinator: Arc<dyn ReplicaCoordinator>,
    messenger: Arc<dyn Messenger>,
    tasks: Arc<ProtocolTasks>,
    store: Arc<dyn crate::store::ControlStore>,
    epochs: EpochTable,
    /// Reconfigurators owed an AckStopEpoch once the epoch's stop request
    /// executes. Presence of a key also means a stop submission is pending,
    /// so retransmitted StopEpochs do not resubmit.
    stop_notifiees: HashMap<(ServiceName, Epoch), Vec<NodeId>>,
    /// One pending fetch per (name, prev_epoch), aligned with the fetch task
    /// in the scheduler. Carries what is needed to create the new epoch when
    /// the predecessor checkpoint arrives.
    fetches: HashMap<String, FetchContext>,
    profiler: AggregateDemandProfiler,
    app_requests_seen: u64,
}

struct FetchContext {
    service_name: ServiceName,
    epoch: Epoch,
    members: BTreeSet<NodeId>,
}

#[derive(Debug, thiserror::Error)]
pub enum AppRequestError {
    #[error("this node hosts no running epoch of '{0}'")]
    NotHosted(String),
    #[error("epoch of '{0}' is still starting on this node")]
    StillStarting(String),
    #[error("active replica task has exited")]
    ActorExited,
}

impl ActiveReplica {
    pub fn new(config: ActiveReplicaConfig) -> Self {
        ActiveReplica {
            logger: config.logger,
            my_node_id: config.my_node_id,
            node_map: config.node_map,
            coordinator: config.coordinator,
            messenger: config.messenger,
            tasks: config.tasks,
            store: config.store,
            epochs: EpochTable::new(),
            stop_notifiees: HashMap::new(),
            fetches: HashMap::new(),
            profiler: config.profiler,
            app_requests_seen: 0,
        }
    }

    /// Seeds a live epoch locally without the start protocol. Used at
    /// bootstrap for the NODE_CONFIG group every reconfigurator hosts.
    pub async fn seed_epoch(&mut self, name: &ServiceName, epoch: Epoch, members: BTreeSet<NodeId>, state: Bytes) {
        if self.epochs.get(name, epoch).is_some() {
            return;
        }
        if let Err(err) = self
            .coordinator
            .create_group(name, epoch, state, members.clone())
            .await
        {
            slog::warn!(self.logger, "Seeding {}:{} failed: {}", name, epoch, err);
            return;
        }
        self.epochs.insert_live(name, epoch, members, EpochStatus::Running);
        self.persist_name_record(name);
    }

    pub async fn handle_protocol(&mut self, envelope: Envelope) {
        slog::debug!(self.logger, "AR received {} from {:?}", envelope.message.summary(), envelope.sender);
        let sender = envelope.sender;
        match envelope.message {
            ReconfigMessage::StopEpoch(m) => self.handle_stop_epoch(sender, m).await,
            ReconfigMessage::StartEpoch(m) => self.handle_start_epoch(sender, m).await,
            ReconfigMessage::DropEpochFinalState(m) => self.handle_drop_epoch(sender, m).await,
            ReconfigMessage::RequestEpochFinalState(m) => self.handle_request_final_state(sender, m),
            ReconfigMessage::EpochFinalState(m) => self.handle_epoch_final_state(m).await,
            other => {
                slog::info!(self.logger, "AR ignoring {}", other.summary());
            }
        }
    }

    /// StopEpoch: a running epoch submits the distinguished stop request and
    /// acks only after it executes; everything else acks immediately with
    /// whatever checkpoint (if any) is retained.
    async fn handle_stop_epoch(&mut self, sender: NodeId, stop: StopEpoch) {
        let pending_key = (stop.service_name.clone(), stop.epoch);
        if let Some(notifiees) = self.stop_notifiees.get_mut(&pending_key) {
            // Stop already coordinating; remember the (re)transmitter, do not
            // resubmit.
            if !notifiees.contains(&sender) {
                notifiees.push(sender);
            }
            return;
        }

        match self.epochs.status(&stop.service_name, stop.epoch) {
            Some(EpochStatus::Running) => {
                self.stop_notifiees.insert(pending_key, vec![sender]);
                let stop_request = self.coordinator.stop_request_for(&stop.service_name, stop.epoch);
                if let Err(err) = self.coordinator.submit(stop_request).await {
                    slog::warn!(self.logger, "Stop submission for {} failed: {}", stop.service_name, err);
                    self.stop_notifiees.remove(&(stop.service_name, stop.epoch));
                }
            }
            Some(status) if status.has_checkpoint() => {
                let checkpoint = self.epochs.final_checkpoint(&stop.service_name, stop.epoch);
                self.send_ack_stop(sender, stop.service_name, stop.epoch, checkpoint);
            }
            _ => {
                // Never hosted, still starting, superseded, or dropped: a
                // positive ack with no checkpoint. Members that actually
                // stopped carry the checkpoint duty.
                self.send_ack_stop(sender, stop.service_name, stop.epoch, None);
            }
        }
    }

    /// Completion callback from the coordinator. Only the stop request needs
    /// work here: checkpoint, delete the replica group, then ack, in that
    /// order, so a confirmed delete can never be followed by a read of the
    /// undeleted record on this node.
    pub async fn handle_executed(&mut self, notice: ExecutedNotice) {
        if !notice.request.is_stop {
            return;
        }
        let name = notice.request.service_name.clone();
        let epoch = notice.request.epoch;

        let Some(notifiees) = self.stop_notifiees.remove(&(name.clone(), epoch)) else {
            return;
        };

        // In a replicated group the stop may have committed through a peer's
        // submission; what matters is that the checkpoint now exists, not
        // whose submission won.
        match self.coordinator.final_state(&name, epoch).await {
            Some(checkpoint) => {
                self.epochs.mark_stopped(&name, epoch, checkpoint);
                if self.coordinator.delete_group(&name, epoch).await.is_ok() {
                    self.epochs.mark_final_kept(&name, epoch);
                }
            }
            None => {
                slog::warn!(self.logger, "Stop of {}:{} executed without a checkpoint", name, epoch);
            }
        }
        self.persist_name_record(&name);

        let checkpoint = self.epochs.final_checkpoint(&name, epoch);
        for notifiee in notifiees {
            self.send_ack_stop(notifiee, name.clone(), epoch, checkpoint.clone());
        }
    }

    /// StartEpoch: create immediately when the state is at hand (creation,
    /// inline checkpoint), otherwise spawn/join the one fetch task for the
    /// predecessor epoch and ack after it restores.
    async fn handle_start_epoch(&mut self, sender: NodeId, start: StartEpoch) {
        match self.epochs.status(&start.service_name, start.epoch) {
            Some(EpochStatus::Starting) => {
                // Fetch in flight; attach as one more notifiee of it.
                if let Some(prev_epoch) = start.prev_epoch {
                    let key = task_key("fetch", &start.service_name, prev_epoch);
                    self.tasks.spawn_round_robin(
                        key,
                        start.prev_epoch_group.iter().cloned().collect(),
                        ReconfigMessage::RequestEpochFinalState(RequestEpochFinalState {
                            service_name: start.service_name.clone(),
                            epoch: prev_epoch,
                        }),
                        Some(sender),
                    );
                }
                return;
            }
            Some(_) => {
                // Already created (or moved past) this epoch; positive ack.
                self.send_ack_start(sender, start.service_name, start.epoch);
                return;
            }
            None => {}
        }

        let inline_state = start.initial_state.is_some() || start.prev_epoch_group.is_empty();
        if inline_state {
            let initial_state = start.initial_state.unwrap_or_default();
            if let Err(err) = self
                .coordinator
                .create_group(&start.service_name, start.epoch, initial_state, start.members.clone())
                .await
            {
                slog::warn!(self.logger, "Creating group {}:{} failed: {}", start.service_name, start.epoch, err);
                return;
            }
            self.install_live_epoch(&start.service_name, start.epoch, start.members, EpochStatus::Running)
                .await;
            self.persist_name_record(&start.service_name);
            self.send_ack_start(sender, start.service_name, start.epoch);
            return;
        }

        // Fetch the predecessor's final state peer-to-peer, then ack.
        let prev_epoch = match start.prev_epoch {
            Some(prev_epoch) => prev_epoch,
            None => {
                slog::warn!(self.logger, "StartEpoch for {} has a group but no prev epoch", start.service_name);
                return;
            }
        };

        self.install_live_epoch(&start.service_name, start.epoch, start.members.clone(), EpochStatus::Starting)
            .await;
        self.persist_name_record(&start.service_name);

        let key = task_key("fetch", &start.service_name, prev_epoch);
        self.fetches.insert(
            key.clone(),
            FetchContext {
                service_name: start.service_name.clone(),
                epoch: start.epoch,
                members: start.members,
            },
        );
        self.tasks.spawn_round_robin(
            key,
            start.prev_epoch_group.iter().cloned().collect(),
            ReconfigMessage::RequestEpochFinalState(RequestEpochFinalState {
                service_name: start.service_name,
                epoch: prev_epoch,
            }),
            Some(sender),
        );
    }

    /// The fetched predecessor checkpoint arrived: restore it through the
    /// coordinator, mark the new epoch running, and ack every reconfigurator
    /// attached to the fetch.
    async fn handle_epoch_final_state(&mut self, final_state: EpochFinalState) {
        let key = task_key("fetch", &final_state.service_name, final_state.epoch);
        let Some(context) = self.fetches.remove(&key) else {
            // Duplicate response after the fetch completed or was dropped.
            return;
        };
        let notifiees = self.tasks.cancel(&key).unwrap_or_default();

        if let Err(err) = self
            .coordinator
            .create_group(
                &context.service_name,
                context.epoch,
                final_state.final_state,
                context.members,
            )
            .await
        {
            slog::warn!(self.logger, "Restoring {}:{} failed: {}", context.service_name, context.epoch, err);
            return;
        }
        self.epochs.set_running(&context.service_name, context.epoch);
        self.persist_name_record(&context.service_name);

        for notifiee in notifiees {
            self.send_ack_start(notifiee, context.service_name.clone(), context.epoch);
        }
    }

    /// Answer with the retained checkpoint, or silently drop: the requester
    /// retransmits round-robin and some stopped member will answer.
    fn handle_request_final_state(&mut self, sender: NodeId, request: RequestEpochFinalState) {
        let Some(checkpoint) = self.epochs.final_checkpoint(&request.service_name, request.epoch) else {
            slog::debug!(
                self.logger,
                "No final state for {}:{}, dropping request",
                request.service_name,
                request.epoch
            );
            return;
        };

        self.send_async(
            sender,
            ReconfigMessage::EpochFinalState(EpochFinalState {
                service_name: request.service_name,
                epoch: request.epoch,
                final_state: checkpoint,
            }),
        );
    }

    /// DropEpochFinalState: discard the checkpoint, tombstone the epoch, and
    /// garbage-collect the now-pointless fetch of the epoch before it. Acked
    /// even when nothing was held, or the reconfigurator would wait forever
    /// on a member that never finished starting.
    async fn handle_drop_epoch(&mut self, sender: NodeId, drop: DropEpochFinalState) {
        if let Some(prev_epoch) = drop.epoch.prev() {
            let fetch_key = task_key("fetch", &drop.service_name, prev_epoch);
            if self.tasks.cancel(&fetch_key).is_some() {
                slog::info!(
                    self.logger,
                    "Dropped pending fetch of {}:{} superseded by drop of epoch {}",
                    drop.service_name,
                    prev_epoch,
                    drop.epoch
                );
            }
            self.fetches.remove(&fetch_key);
        }

        if self.epochs.get(&drop.service_name, drop.epoch).is_some() {
            self.coordinator.delete_final_state(&drop.service_name, drop.epoch).await;
            let _ = self.coordinator.delete_group(&drop.service_name, drop.epoch).await;
            self.epochs.mark_dropped(&drop.service_name, drop.epoch);
            self.persist_name_record(&drop.service_name);
        }

        self.send_async(
            sender,
            ReconfigMessage::AckDropEpochFinalState(AckDropEpochFinalState {
                service_name: drop.service_name,
                epoch: drop.epoch,
            }),
        );
    }

    /// An application request: linearize it through the coordinator, update
    /// demand stats, and answer with the group's resulting state.
    pub async fn handle_app_request(&mut self, name: ServiceName, payload: Bytes) -> Result<Bytes, AppRequestError> {
        let (epoch, instance) = self
            .epochs
            .live_epoch(&name)
            .ok_or_else(|| AppRequestError::NotHosted(name.clone().into_inner()))?;
        if instance.status == EpochStatus::Starting {
            return Err(AppRequestError::StillStarting(name.into_inner()));
        }

        self.coordinator
            .submit(GroupRequest {
                service_name: name.clone(),
                epoch,
                payload,
                is_stop: false,
            })
            .await
            .map_err(|_| AppRequestError::NotHosted(name.clone().into_inner()))?;

        self.update_demand_stats(&name, epoch).await;

        let state = self
            .coordinator
            .group_state(&name, epoch)
            .await
            .unwrap_or_default();
        Ok(state)
    }

    /// Demand stats update on every app request; a report goes to a random
    /// reconfigurator when the policy says so. Stop requests never reach
    /// here, so they never count.
    async fn update_demand_stats(&mut self, name: &ServiceName, epoch: Epoch) {
        self.app_requests_seen += 1;
        if self.app_requests_seen % DEMAND_TRIM_STRIDE == 0 {
            self.profiler.trim();
        }

        if !self.profiler.register(name, None) {
            return;
        }
        let Some(profile) = self.profiler.pluck(name) else {
            return;
        };

        let reconfigurators = self.node_map.reconfigurators();
        let Some(reportee) = reconfigurators.iter().choose(&mut rand::thread_rng()).cloned() else {
            return;
        };

        self.send_async(
            reportee,
            ReconfigMessage::DemandReport(DemandReport {
                service_name: name.clone(),
                epoch,
                profile: profile.encode(),
            }),
        );
    }

    /// Registers the epoch and cleans up anything it superseded.
    async fn install_live_epoch(
        &mut self,
        name: &ServiceName,
        epoch: Epoch,
        members: BTreeSet<NodeId>,
        status: EpochStatus,
    ) {
        let superseded = self.epochs.insert_live(name, epoch, members, status);
        for old_epoch in superseded {
            slog::info!(self.logger, "Epoch {}:{} superseded by {}", name, old_epoch, epoch);
            let _ = self.coordinator.delete_group(name, old_epoch).await;
        }
    }

    fn send_ack_stop(&self, to: NodeId, service_name: ServiceName, epoch: Epoch, final_state: Option<Bytes>) {
        self.send_async(
            to,
            ReconfigMessage::AckStopEpoch(AckStopEpoch {
                service_name,
                epoch,
                final_state,
            }),
        );
    }

    fn send_ack_start(&self, to: NodeId, service_name: ServiceName, epoch: Epoch) {
        self.send_async(
            to,
            ReconfigMessage::AckStartEpoch(AckStartEpoch { service_name, epoch }),
        );
    }

    /// Acks are fire-and-forget: a lost ack is repaired by the sender's
    /// retransmission of the request, not by us.
    fn send_async(&self, to: NodeId, message: ReconfigMessage) {
        let messenger = self.messenger.clone();
        let logger = self.logger.clone();
        let envelope = Envelope {
            sender: self.my_node_id.clone(),
            message,
        };
        tokio::task::spawn(async move {
            if let Err(err) = messenger.send(&to, envelope).await {
                slog::debug!(logger, "Send to {:?} failed: {}", to, err);
            }
        });
    }

    fn persist_name_record(&self, name: &ServiceName) {
        let Some(epoch) = self.epochs.highest_epoch(name) else {
            let _ = self.store.remove_name_record(name);
            return;
        };
        let Some(instance) = self.epochs.get(name, epoch) else {
            return;
        };

        let record = NameRecord {
            name: name.clone(),
            epoch,
            status: instance.status,
            members: instance.members.clone(),
            retained_checkpoints: self.epochs.retained_checkpoints(name),
            user_fields: Bytes::new(),
        };
        if let Err(err) = self.store.write_name_record(record) {
            slog::warn!(self.logger, "Persisting name record for {} failed: {}", name, err);
        }
    }

    #[cfg(test)]
    pub(crate) fn epoch_status(&self, name: &ServiceName, epoch: Epoch) -> Option<EpochStatus> {
        self.epochs.status(name, epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::LocalCoordinator;
    use crate::demand::NullDemandPolicy;
    use crate::messenger::LoopbackNetwork;
    use crate::node::{NodeMap, NodeMetadata, NodeRoles};
    use crate::store::MemoryControlStore;
    use crate::tasks::RestartIntervals;
    use std::net::Ipv4Addr;
    use tokio::sync::mpsc;
    use tokio::time::Duration;

    struct Fixture {
        replica: ActiveReplica,
        coordinator: Arc<LocalCoordinator>,
        executed_rx: mpsc::UnboundedReceiver<ExecutedNotice>,
        inboxes: HashMap<NodeId, mpsc::UnboundedReceiver<Envelope>>,
        _network: LoopbackNetwork,
    }

    fn test_node_map() -> NodeMap {
        let mut metadata = vec![NodeMetadata::new(
            NodeId::new("rc1"),
            Ipv4Addr::LOCALHOST,
            3100,
            NodeRoles {
                active: false,
                reconfigurator: true,
            },
        )];
        for (i, id) in ["a", "b"].iter().enumerate() {
            metadata.push(NodeMetadata::new(
                NodeId::new(*id),
                Ipv4Addr::LOCALHOST,
                3000 + i as u16,
                NodeRoles {
                    active: true,
                    reconfigurator: false,
                },
            ));
        }
        NodeMap::try_create(metadata).unwrap()
    }

    /// Fixture for the replica on node "b". Peers "a", "rc1", "rc2" get
    /// loopback inboxes to observe what "b" sends.
    fn fixture() -> Fixture {
        fixture_with_policy(Arc::new(NullDemandPolicy))
    }

    fn fixture_with_policy(policy: Arc<dyn crate::demand::DemandPolicy>) -> Fixture {
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let network = LoopbackNetwork::new();
        let mut inboxes = HashMap::new();
        for id in ["a", "rc1", "rc2"] {
            inboxes.insert(NodeId::new(id), network.attach(NodeId::new(id)));
        }

        let (executed_tx, executed_rx) = mpsc::unbounded_channel();
        let coordinator = Arc::new(LocalCoordinator::new(executed_tx));

        // Interval far beyond test runtime: the fetch task sends exactly one
        // immediate round.
        let tasks = Arc::new(ProtocolTasks::new(
            logger.clone(),
            NodeId::new("b"),
            Arc::new(network.messenger()),
            RestartIntervals {
                initial: Duration::from_secs(600),
                cap: Duration::from_secs(600),
            },
        ));

        let replica = ActiveReplica::new(ActiveReplicaConfig {
            logger,
            my_node_id: NodeId::new("b"),
            node_map: test_node_map(),
            coordinator: coordinator.clone(),
            messenger: Arc::new(network.messenger()),
            tasks,
            store: Arc::new(MemoryControlStore::new()),
            profiler: AggregateDemandProfiler::new(policy),
        });

        Fixture {
            replica,
            coordinator,
            executed_rx,
            inboxes,
            _network: network,
        }
    }

    fn svc() -> ServiceName {
        ServiceName::new("svc")
    }

    fn members(ids: &[&str]) -> BTreeSet<NodeId> {
        ids.iter().map(|id| NodeId::new(*id)).collect()
    }

    async fn expect_message(fixture: &mut Fixture, node: &str) -> ReconfigMessage {
        let inbox = fixture.inboxes.get_mut(&NodeId::new(node)).unwrap();
        let envelope = tokio::time::timeout(Duration::from_secs(5), inbox.recv())
            .await
            .expect("Expected a protocol message")
            .unwrap();
        assert_eq!(envelope.sender, NodeId::new("b"));
        envelope.message
    }

    async fn start_epoch_zero(fixture: &mut Fixture) {
        fixture
            .replica
            .handle_start_epoch(
                NodeId::new("rc1"),
                StartEpoch {
                    service_name: svc(),
                    epoch: Epoch::initial(),
                    members: members(&["b"]),
                    prev_epoch_group: BTreeSet::new(),
                    prev_epoch: None,
                    initial_state: Some(Bytes::from_static(b"v0")),
                },
            )
            .await;

        match expect_message(fixture, "rc1").await {
            ReconfigMessage::AckStartEpoch(m) => assert_eq!(m.epoch, Epoch::initial()),
            other => panic!("expected AckStartEpoch, got {:?}", other),
        }
    }

    fn stop(epoch: u32) -> StopEpoch {
        StopEpoch {
            service_name: svc(),
            epoch: Epoch::new(epoch),
        }
    }

    #[tokio::test]
    async fn duplicate_stop_produces_one_submission_and_ordered_ack() {
        let mut fixture = fixture();
        start_epoch_zero(&mut fixture).await;

        fixture.replica.handle_stop_epoch(NodeId::new("rc1"), stop(0)).await;
        fixture.replica.handle_stop_epoch(NodeId::new("rc1"), stop(0)).await;

        // Exactly one stop reached the coordinator.
        let notice = fixture.executed_rx.recv().await.unwrap();
        assert!(notice.request.is_stop);
        assert!(fixture.executed_rx.try_recv().is_err());

        fixture.replica.handle_executed(notice).await;

        match expect_message(&mut fixture, "rc1").await {
            ReconfigMessage::AckStopEpoch(m) => {
                assert_eq!(m.epoch, Epoch::initial());
                assert_eq!(m.final_state, Some(Bytes::from_static(b"v0")));
            }
            other => panic!("expected AckStopEpoch, got {:?}", other),
        }

        // Checkpoint retained, group deleted.
        assert_eq!(
            fixture.replica.epoch_status(&svc(), Epoch::initial()),
            Some(EpochStatus::FinalKept)
        );

        // A late retransmitted stop re-acks from the retained checkpoint
        // without touching the coordinator.
        fixture.replica.handle_stop_epoch(NodeId::new("rc1"), stop(0)).await;
        match expect_message(&mut fixture, "rc1").await {
            ReconfigMessage::AckStopEpoch(m) => assert_eq!(m.final_state, Some(Bytes::from_static(b"v0"))),
            other => panic!("expected AckStopEpoch, got {:?}", other),
        }
        assert!(fixture.executed_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stop_for_unknown_epoch_acks_with_no_checkpoint() {
        let mut fixture = fixture();

        fixture.replica.handle_stop_epoch(NodeId::new("rc1"), stop(3)).await;

        match expect_message(&mut fixture, "rc1").await {
            ReconfigMessage::AckStopEpoch(m) => {
                assert_eq!(m.epoch, Epoch::new(3));
                assert_eq!(m.final_state, None);
            }
            other => panic!("expected AckStopEpoch, got {:?}", other),
        }
        assert!(fixture.executed_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn duplicate_start_is_a_positive_noop() {
        let mut fixture = fixture();
        start_epoch_zero(&mut fixture).await;

        start_epoch_zero(&mut fixture).await;
        assert_eq!(
            fixture.replica.epoch_status(&svc(), Epoch::initial()),
            Some(EpochStatus::Running)
        );
    }

    #[tokio::test]
    async fn start_with_prev_group_fetches_then_acks_all_notifiees() {
        let mut fixture = fixture();

        let start = StartEpoch {
            service_name: svc(),
            epoch: Epoch::new(1),
            members: members(&["b"]),
            prev_epoch_group: members(&["a"]),
            prev_epoch: Some(Epoch::initial()),
            initial_state: None,
        };
        fixture.replica.handle_start_epoch(NodeId::new("rc1"), start.clone()).await;

        assert_eq!(
            fixture.replica.epoch_status(&svc(), Epoch::new(1)),
            Some(EpochStatus::Starting)
        );
        match expect_message(&mut fixture, "a").await {
            ReconfigMessage::RequestEpochFinalState(m) => assert_eq!(m.epoch, Epoch::initial()),
            other => panic!("expected RequestEpochFinalState, got {:?}", other),
        }

        // While starting, app traffic is refused.
        let result = fixture.replica.handle_app_request(svc(), Bytes::from_static(b"w")).await;
        assert!(matches!(result, Err(AppRequestError::StillStarting(_))));

        // A concurrent StartEpoch from another reconfigurator attaches to the
        // one fetch instead of spawning a second.
        fixture.replica.handle_start_epoch(NodeId::new("rc2"), start).await;

        fixture
            .replica
            .handle_protocol(Envelope {
                sender: NodeId::new("a"),
                message: ReconfigMessage::EpochFinalState(EpochFinalState {
                    service_name: svc(),
                    epoch: Epoch::initial(),
                    final_state: Bytes::from_static(b"v1"),
                }),
            })
            .await;

        for rc in ["rc1", "rc2"] {
            match expect_message(&mut fixture, rc).await {
                ReconfigMessage::AckStartEpoch(m) => assert_eq!(m.epoch, Epoch::new(1)),
                other => panic!("expected AckStartEpoch, got {:?}", other),
            }
        }
        assert_eq!(
            fixture.replica.epoch_status(&svc(), Epoch::new(1)),
            Some(EpochStatus::Running)
        );
        assert_eq!(
            fixture.coordinator.group_state(&svc(), Epoch::new(1)).await,
            Some(Bytes::from_static(b"v1"))
        );

        // A duplicate response for a completed fetch is dropped.
        fixture
            .replica
            .handle_protocol(Envelope {
                sender: NodeId::new("a"),
                message: ReconfigMessage::EpochFinalState(EpochFinalState {
                    service_name: svc(),
                    epoch: Epoch::initial(),
                    final_state: Bytes::from_static(b"stale"),
                }),
            })
            .await;
        assert_eq!(
            fixture.coordinator.group_state(&svc(), Epoch::new(1)).await,
            Some(Bytes::from_static(b"v1"))
        );
    }

    #[tokio::test]
    async fn request_final_state_answers_only_when_checkpoint_held() {
        let mut fixture = fixture();
        start_epoch_zero(&mut fixture).await;

        // Nothing stopped yet: silently dropped.
        fixture.replica.handle_request_final_state(
            NodeId::new("a"),
            RequestEpochFinalState {
                service_name: svc(),
                epoch: Epoch::initial(),
            },
        );

        fixture.replica.handle_stop_epoch(NodeId::new("rc1"), stop(0)).await;
        let notice = fixture.executed_rx.recv().await.unwrap();
        fixture.replica.handle_executed(notice).await;
        match expect_message(&mut fixture, "rc1").await {
            ReconfigMessage::AckStopEpoch(_) => {}
            other => panic!("expected AckStopEpoch, got {:?}", other),
        }

        fixture.replica.handle_request_final_state(
            NodeId::new("a"),
            RequestEpochFinalState {
                service_name: svc(),
                epoch: Epoch::initial(),
            },
        );
        match expect_message(&mut fixture, "a").await {
            ReconfigMessage::EpochFinalState(m) => {
                assert_eq!(m.epoch, Epoch::initial());
                assert_eq!(m.final_state, Bytes::from_static(b"v0"));
            }
            other => panic!("expected EpochFinalState, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn drop_tombstones_cancels_fetch_and_always_acks() {
        let mut fixture = fixture();

        // Epoch 1 is starting, fetching epoch 0 from "a".
        fixture
            .replica
            .handle_start_epoch(
                NodeId::new("rc1"),
                StartEpoch {
                    service_name: svc(),
                    epoch: Epoch::new(1),
                    members: members(&["b"]),
                    prev_epoch_group: members(&["a"]),
                    prev_epoch: Some(Epoch::initial()),
                    initial_state: None,
                },
            )
            .await;
        match expect_message(&mut fixture, "a").await {
            ReconfigMessage::RequestEpochFinalState(_) => {}
            other => panic!("expected RequestEpochFinalState, got {:?}", other),
        }

        // Epoch 1 dropped from above: the fetch of epoch 0 will never be
        // useful, the starting instance becomes a tombstone.
        fixture
            .replica
            .handle_drop_epoch(
                NodeId::new("rc1"),
                DropEpochFinalState {
                    service_name: svc(),
                    epoch: Epoch::new(1),
                },
            )
            .await;

        match expect_message(&mut fixture, "rc1").await {
            ReconfigMessage::AckDropEpochFinalState(m) => assert_eq!(m.epoch, Epoch::new(1)),
            other => panic!("expected AckDropEpochFinalState, got {:?}", other),
        }
        assert_eq!(
            fixture.replica.epoch_status(&svc(), Epoch::new(1)),
            Some(EpochStatus::Dropped)
        );

        // A late EpochFinalState for the cancelled fetch is ignored.
        fixture
            .replica
            .handle_protocol(Envelope {
                sender: NodeId::new("a"),
                message: ReconfigMessage::EpochFinalState(EpochFinalState {
                    service_name: svc(),
                    epoch: Epoch::initial(),
                    final_state: Bytes::from_static(b"late"),
                }),
            })
            .await;
        assert_eq!(
            fixture.replica.epoch_status(&svc(), Epoch::new(1)),
            Some(EpochStatus::Dropped)
        );

        // Drops for epochs this node never held are still acked.
        fixture
            .replica
            .handle_drop_epoch(
                NodeId::new("rc1"),
                DropEpochFinalState {
                    service_name: ServiceName::new("never-hosted"),
                    epoch: Epoch::new(9),
                },
            )
            .await;
        match expect_message(&mut fixture, "rc1").await {
            ReconfigMessage::AckDropEpochFinalState(m) => assert_eq!(m.epoch, Epoch::new(9)),
            other => panic!("expected AckDropEpochFinalState, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn app_requests_report_demand_at_the_policy_threshold() {
        let mut fixture = fixture_with_policy(Arc::new(crate::demand::RequestCountPolicy { report_every: 2 }));
        start_epoch_zero(&mut fixture).await;

        fixture
            .replica
            .handle_app_request(svc(), Bytes::from_static(b"w1"))
            .await
            .unwrap();
        fixture
            .replica
            .handle_app_request(svc(), Bytes::from_static(b"w2"))
            .await
            .unwrap();

        // The second request crossed the threshold; the plucked profile went
        // to the only reconfigurator.
        match expect_message(&mut fixture, "rc1").await {
            ReconfigMessage::DemandReport(m) => {
                assert_eq!(m.service_name, svc());
                let profile = crate::demand::DemandProfile::decode(m.service_name.clone(), m.profile);
                assert_eq!(profile.request_count, 2);
            }
            other => panic!("expected DemandReport, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn app_request_executes_and_returns_state() {
        let mut fixture = fixture();
        start_epoch_zero(&mut fixture).await;

        let state = fixture
            .replica
            .handle_app_request(svc(), Bytes::from_static(b"v1"))
            .await
            .unwrap();
        assert_eq!(state, Bytes::from_static(b"v1"));

        let result = fixture
            .replica
            .handle_app_request(ServiceName::new("other"), Bytes::from_static(b"x"))
            .await;
        assert!(matches!(result, Err(AppRequestError::NotHosted(_))));
    }
}
