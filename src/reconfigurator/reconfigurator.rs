use crate::actor::Callback;
use crate::demand::{AggregateDemandProfiler, DemandProfile};
use crate::messages::{
    AckDropEpochFinalState, AckStartEpoch, AckStopEpoch, DemandReport, Envelope, ReconfigMessage,
};
use crate::node::{majority, Epoch, NodeId, NodeMap, ServiceName};
use crate::reconfigurator::record::{ReconfigurationRecord, RecordError, RecordState};
use crate::store::ControlStore;
use crate::tasks::{task_key, ProtocolTasks};
use bytes::Bytes;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

pub struct ReconfiguratorConfig {
    pub logger: slog::Logger,
    pub my_node_id: NodeId,
    pub node_map: NodeMap,
    pub store: Arc<dyn ControlStore>,
    pub tasks: Arc<ProtocolTasks>,
    pub profiler: AggregateDemandProfiler,
}

/// Reconfigurator owns the per-name reconfiguration records and drives their
/// epoch transitions. Every record mutation is durably written before the
/// messages reflecting it go out; the retransmission tasks then carry the
/// transition to completion however long that takes.
pub struct Reconfigurator {
    logger: slog::Logger,
    my_node_id: NodeId,
    node_map: NodeMap,
    store: Arc<dyn ControlStore>,
    tasks: Arc<ProtocolTasks>,
    runtime: HashMap<ServiceName, RecordRuntime>,
    profiler: AggregateDemandProfiler,
    /// The current reconfigurator set, tracked by the NODE_CONFIG record.
    rc_set: BTreeSet<NodeId>,
}

/// Ephemeral per-record state: ack tallies and the waiting client. Lost on
/// crash by design; recovery re-emits the record's desired messages and the
/// (idempotent) acks are re-collected.
#[derive(Default)]
struct RecordRuntime {
    start_acks: BTreeSet<NodeId>,
    drop_acks: BTreeSet<NodeId>,
    requester: Option<Callback<(), ControlError>>,
}

/// Snapshot answer for RequestActiveReplicas. May race with an in-progress
/// change and show the pre-change group; that is explicitly permitted.
#[derive(Clone, Debug)]
pub struct ActivesView {
    pub service_name: ServiceName,
    pub epoch: Epoch,
    pub actives: BTreeSet<NodeId>,
}

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("no record for name '{0}'")]
    NotFound(String),
    #[error("record for name '{0}' already exists")]
    AlreadyExists(String),
    #[error("record for name '{0}' is mid-reconfiguration")]
    Busy(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("control store failure: {0}")]
    Store(String),
    #[error("reconfigurator task has exited")]
    ActorExited,
}

impl Reconfigurator {
    /// Builds the reconfigurator and resumes any transition that was in
    /// flight when the previous process died: each stored record's state
    /// fully determines the messages to re-emit.
    pub fn new(config: ReconfiguratorConfig) -> Self {
        let mut reconfigurator = Reconfigurator {
            logger: config.logger,
            my_node_id: config.my_node_id,
            rc_set: config.node_map.reconfigurators(),
            node_map: config.node_map,
            store: config.store,
            tasks: config.tasks,
            runtime: HashMap::new(),
            profiler: config.profiler,
        };
        reconfigurator.bootstrap_node_config();
        reconfigurator.recover();
        reconfigurator
    }

    /// The NODE_CONFIG record tracks the reconfigurator set itself. At first
    /// boot every reconfigurator derives the same epoch-0 record from the
    /// static node map, so no protocol round is needed to agree on it.
    fn bootstrap_node_config(&mut self) {
        let name = ServiceName::node_config();
        match self.store.read_rc_record(&name) {
            Some(record) => {
                self.rc_set = record.actives.clone();
            }
            None => {
                let mut record =
                    ReconfigurationRecord::create(name, self.node_map.reconfigurators(), Bytes::new());
                record.apply_start_acked();
                if let Err(err) = self.store.write_rc_record(record) {
                    slog::error!(self.logger, "Bootstrapping NODE_CONFIG failed: {}", err);
                }
            }
        }
    }

    fn recover(&mut self) {
        for name in self.store.rc_record_names() {
            let Some(record) = self.store.read_rc_record(&name) else {
                continue;
            };
            if record.state != RecordState::Ready {
                slog::info!(
                    self.logger,
                    "Resuming {:?} transition for '{}' at epoch {}",
                    record.state,
                    name,
                    record.epoch
                );
                self.runtime.entry(name).or_default();
                self.spawn_desired(&record);
            }
        }
    }

    pub fn handle_create(
        &mut self,
        name: ServiceName,
        initial_group: BTreeSet<NodeId>,
        initial_state: Bytes,
        callback: Callback<(), ControlError>,
    ) {
        if name.is_node_config() {
            callback.send(Err(ControlError::InvalidConfig(
                "NODE_CONFIG is reserved for the reconfigurator set".to_string(),
            )));
            return;
        }
        if let Err(err) = self.validate_active_group(&initial_group) {
            callback.send(Err(err));
            return;
        }
        if self.store.read_rc_record(&name).is_some() {
            callback.send(Err(ControlError::AlreadyExists(name.into_inner())));
            return;
        }

        let record = ReconfigurationRecord::create(name.clone(), initial_group, initial_state);
        if let Err(err) = self.store.write_rc_record(record.clone()) {
            callback.send(Err(ControlError::Store(err.to_string())));
            return;
        }

        let runtime = self.runtime.entry(name).or_default();
        runtime.start_acks.clear();
        runtime.requester = Some(callback);
        self.spawn_desired(&record);
    }

    pub fn handle_delete(&mut self, name: ServiceName, callback: Callback<(), ControlError>) {
        if name.is_node_config() {
            callback.send(Err(ControlError::InvalidConfig(
                "NODE_CONFIG cannot be deleted".to_string(),
            )));
            return;
        }
        let Some(mut record) = self.store.read_rc_record(&name) else {
            callback.send(Err(ControlError::NotFound(name.into_inner())));
            return;
        };

        if let Err(RecordError::Busy) = record.begin_delete() {
            callback.send(Err(ControlError::Busy(name.into_inner())));
            return;
        }
        if let Err(err) = self.store.write_rc_record(record.clone()) {
            callback.send(Err(ControlError::Store(err.to_string())));
            return;
        }

        let runtime = self.runtime.entry(name).or_default();
        runtime.start_acks.clear();
        runtime.drop_acks.clear();
        runtime.requester = Some(callback);
        self.spawn_desired(&record);
    }

    pub fn handle_change_replicas(
        &mut self,
        name: ServiceName,
        new_group: BTreeSet<NodeId>,
        callback: Callback<(), ControlError>,
    ) {
        if name.is_node_config() {
            callback.send(Err(ControlError::InvalidConfig(
                "use ReconfigureNodeConfig for the reconfigurator set".to_string(),
            )));
            return;
        }
        if let Err(err) = self.validate_active_group(&new_group) {
            callback.send(Err(err));
            return;
        }
        self.start_change(name, new_group, Some(callback));
    }

    /// Operator add/remove of reconfigurator nodes: computed into a full
    /// replacement set and run as an ordinary reconfiguration of the
    /// NODE_CONFIG record, against the embedded active replicas every
    /// reconfigurator hosts.
    pub fn handle_node_config_change(
        &mut self,
        added: BTreeSet<NodeId>,
        removed: BTreeSet<NodeId>,
        callback: Callback<(), ControlError>,
    ) {
        let new_rc_set = match self
            .node_map
            .reconfigured_rc_set(&self.my_node_id, &self.rc_set, &added, &removed)
        {
            Ok(set) => set,
            Err(err) => {
                callback.send(Err(ControlError::InvalidConfig(err.to_string())));
                return;
            }
        };

        self.start_change(ServiceName::node_config(), new_rc_set, Some(callback));
    }

    fn start_change(
        &mut self,
        name: ServiceName,
        new_group: BTreeSet<NodeId>,
        callback: Option<Callback<(), ControlError>>,
    ) {
        let Some(mut record) = self.store.read_rc_record(&name) else {
            if let Some(callback) = callback {
                callback.send(Err(ControlError::NotFound(name.into_inner())));
            }
            return;
        };

        if let Err(RecordError::Busy) = record.begin_change(new_group) {
            if let Some(callback) = callback {
                callback.send(Err(ControlError::Busy(name.into_inner())));
            }
            return;
        }
        if let Err(err) = self.store.write_rc_record(record.clone()) {
            if let Some(callback) = callback {
                callback.send(Err(ControlError::Store(err.to_string())));
            }
            return;
        }

        let runtime = self.runtime.entry(name).or_default();
        runtime.start_acks.clear();
        runtime.drop_acks.clear();
        runtime.requester = callback;
        self.spawn_desired(&record);
    }

    pub fn handle_request_actives(&self, name: ServiceName, callback: Callback<ActivesView, ControlError>) {
        match self.store.read_rc_record(&name) {
            Some(record) => callback.send(Ok(ActivesView {
                service_name: name,
                epoch: record.epoch,
                actives: record.actives,
            })),
            None => callback.send(Err(ControlError::NotFound(name.into_inner()))),
        }
    }

    pub fn handle_protocol(&mut self, envelope: Envelope) {
        slog::debug!(self.logger, "RC received {} from {:?}", envelope.message.summary(), envelope.sender);
        let sender = envelope.sender;
        match envelope.message {
            ReconfigMessage::AckStopEpoch(m) => self.handle_ack_stop(sender, m),
            ReconfigMessage::AckStartEpoch(m) => self.handle_ack_start(sender, m),
            ReconfigMessage::AckDropEpochFinalState(m) => self.handle_ack_drop(sender, m),
            ReconfigMessage::DemandReport(m) => self.handle_demand_report(sender, m),
            other => {
                slog::info!(self.logger, "RC ignoring {}", other.summary());
            }
        }
    }

    /// The first stop ack for the record's current epoch completes the stop
    /// wait: epoch bumps, the pending group takes over. Later duplicates
    /// find the state machine already past WAIT_ACK_STOP and fall through.
    fn handle_ack_stop(&mut self, sender: NodeId, ack: AckStopEpoch) {
        let Some(mut record) = self.store.read_rc_record(&ack.service_name) else {
            return;
        };
        if record.state != RecordState::WaitAckStop
            || ack.epoch != record.epoch
            || !record.actives.contains(&sender)
        {
            return;
        }

        self.cancel_desired(&record);
        record.apply_stop_acked(ack.final_state);
        if let Err(err) = self.store.write_rc_record(record.clone()) {
            slog::error!(self.logger, "Persisting stop-acked record for '{}' failed: {}", record.name, err);
            return;
        }

        if let Some(runtime) = self.runtime.get_mut(&ack.service_name) {
            runtime.start_acks.clear();
            runtime.drop_acks.clear();
        }
        self.spawn_desired(&record);
    }

    /// Start acks tally per member; a majority of the new group completes
    /// the start wait.
    fn handle_ack_start(&mut self, sender: NodeId, ack: AckStartEpoch) {
        let Some(mut record) = self.store.read_rc_record(&ack.service_name) else {
            return;
        };
        if record.state != RecordState::WaitAckStart
            || ack.epoch != record.epoch
            || !record.actives.contains(&sender)
        {
            return;
        }

        let runtime = self.runtime.entry(ack.service_name.clone()).or_default();
        runtime.start_acks.insert(sender);
        if runtime.start_acks.len() < majority(record.actives.len()) {
            return;
        }

        self.cancel_desired(&record);
        record.apply_start_acked();
        if let Err(err) = self.store.write_rc_record(record.clone()) {
            slog::error!(self.logger, "Persisting start-acked record for '{}' failed: {}", record.name, err);
            return;
        }

        if record.state == RecordState::Ready {
            self.finish_transition(record);
        } else {
            self.spawn_desired(&record);
        }
    }

    /// Drop acks must come from every prior-group member before the old
    /// epoch's references are cleared.
    fn handle_ack_drop(&mut self, sender: NodeId, ack: AckDropEpochFinalState) {
        let Some(mut record) = self.store.read_rc_record(&ack.service_name) else {
            return;
        };
        if record.state != RecordState::WaitAckDrop
            || Some(ack.epoch) != record.prev_epoch
            || !record.prev_actives.contains(&sender)
        {
            return;
        }

        let runtime = self.runtime.entry(ack.service_name.clone()).or_default();
        runtime.drop_acks.insert(sender);
        if runtime.drop_acks.len() < record.prev_actives.len() {
            return;
        }

        self.cancel_desired(&record);
        let delete_record = record.apply_drop_acked();

        if delete_record {
            if let Err(err) = self.store.remove_rc_record(&ack.service_name) {
                slog::error!(self.logger, "Removing deleted record '{}' failed: {}", ack.service_name, err);
                return;
            }
            if let Some(mut runtime) = self.runtime.remove(&ack.service_name) {
                if let Some(requester) = runtime.requester.take() {
                    requester.send(Ok(()));
                }
            }
        } else {
            if let Err(err) = self.store.write_rc_record(record.clone()) {
                slog::error!(self.logger, "Persisting drop-acked record for '{}' failed: {}", record.name, err);
                return;
            }
            self.finish_transition(record);
        }
    }

    /// Advisory demand input. A report can induce an ordinary group change
    /// when the policy proposes one and the record is idle.
    fn handle_demand_report(&mut self, sender: NodeId, report: DemandReport) {
        slog::debug!(self.logger, "Demand report for '{}' from {:?}", report.service_name, sender);
        let profile = DemandProfile::decode(report.service_name.clone(), report.profile);
        self.profiler.combine(profile);

        let Some(record) = self.store.read_rc_record(&report.service_name) else {
            return;
        };
        if !record.is_ready() {
            return;
        }
        if let Some(new_group) = self.profiler.should_reconfigure(&report.service_name, &record.actives) {
            if new_group != record.actives && self.validate_active_group(&new_group).is_ok() {
                slog::info!(
                    self.logger,
                    "Demand policy reconfiguring '{}' to {:?}",
                    report.service_name,
                    new_group
                );
                self.start_change(report.service_name, new_group, None);
            }
        }
    }

    fn finish_transition(&mut self, record: ReconfigurationRecord) {
        if record.name.is_node_config() {
            self.rc_set = record.actives.clone();
            slog::info!(self.logger, "Reconfigurator set is now {:?}", self.rc_set);
        }

        if let Some(runtime) = self.runtime.get_mut(&record.name) {
            runtime.start_acks.clear();
            runtime.drop_acks.clear();
            if let Some(requester) = runtime.requester.take() {
                requester.send(Ok(()));
            }
        }
    }

    /// Spawns the retransmission task for whatever the record currently
    /// awaits. Idempotent: respawning an already-running key is a no-op.
    fn spawn_desired(&self, record: &ReconfigurationRecord) {
        if let Some(desired) = record.desired_messages() {
            let key = task_key(desired.kind.type_name(), &record.name, desired.message.epoch());
            self.tasks
                .spawn_retransmit(key, desired.targets, desired.message, None);
        }
    }

    fn cancel_desired(&self, record: &ReconfigurationRecord) {
        if let Some(desired) = record.desired_messages() {
            let key = task_key(desired.kind.type_name(), &record.name, desired.message.epoch());
            self.tasks.cancel(&key);
        }
    }

    fn validate_active_group(&self, group: &BTreeSet<NodeId>) -> Result<(), ControlError> {
        if group.is_empty() {
            return Err(ControlError::InvalidConfig("replica group is empty".to_string()));
        }
        for id in group {
            let known_active = self
                .node_map
                .metadata(id)
                .map(|md| md.roles().active)
                .unwrap_or(false);
            if !known_active {
                return Err(ControlError::InvalidConfig(format!(
                    "node '{}' is not a known active replica",
                    id
                )));
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn record(&self, name: &ServiceName) -> Option<ReconfigurationRecord> {
        self.store.read_rc_record(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demand::NullDemandPolicy;
    use crate::messenger::LoopbackNetwork;
    use crate::node::{NodeMetadata, NodeRoles};
    use crate::store::MemoryControlStore;
    use crate::tasks::RestartIntervals;
    use std::net::Ipv4Addr;
    use tokio::sync::mpsc;
    use tokio::time::Duration;

    struct Fixture {
        reconfigurator: Reconfigurator,
        store: Arc<MemoryControlStore>,
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
        for (i, id) in ["a", "b", "c", "d"].iter().enumerate() {
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

    fn fixture() -> Fixture {
        fixture_with(Arc::new(MemoryControlStore::new()), Arc::new(NullDemandPolicy))
    }

    fn fixture_with_store(store: Arc<MemoryControlStore>) -> Fixture {
        fixture_with(store, Arc::new(NullDemandPolicy))
    }

    fn fixture_with(store: Arc<MemoryControlStore>, policy: Arc<dyn crate::demand::DemandPolicy>) -> Fixture {
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let network = LoopbackNetwork::new();
        let mut inboxes = HashMap::new();
        for id in ["a", "b", "c", "d"] {
            inboxes.insert(NodeId::new(id), network.attach(NodeId::new(id)));
        }

        // Interval far beyond test runtime: each task sends exactly one
        // immediate round, keeping assertions deterministic.
        let tasks = Arc::new(ProtocolTasks::new(
            logger.clone(),
            NodeId::new("rc1"),
            Arc::new(network.messenger()),
            RestartIntervals {
                initial: Duration::from_secs(600),
                cap: Duration::from_secs(600),
            },
        ));

        let reconfigurator = Reconfigurator::new(ReconfiguratorConfig {
            logger,
            my_node_id: NodeId::new("rc1"),
            node_map: test_node_map(),
            store: store.clone(),
            tasks,
            profiler: AggregateDemandProfiler::new(policy),
        });

        Fixture {
            reconfigurator,
            store,
            inboxes,
            _network: network,
        }
    }

    fn group(ids: &[&str]) -> BTreeSet<NodeId> {
        ids.iter().map(|id| NodeId::new(*id)).collect()
    }

    fn svc() -> ServiceName {
        ServiceName::new("svc")
    }

    async fn expect_message(fixture: &mut Fixture, node: &str) -> ReconfigMessage {
        let inbox = fixture.inboxes.get_mut(&NodeId::new(node)).unwrap();
        let envelope = tokio::time::timeout(Duration::from_secs(5), inbox.recv())
            .await
            .expect("Expected a protocol message")
            .unwrap();
        assert_eq!(envelope.sender, NodeId::new("rc1"));
        envelope.message
    }

    fn ack_start_from(fixture: &mut Fixture, node: &str, epoch: u32) {
        fixture.reconfigurator.handle_protocol(Envelope {
            sender: NodeId::new(node),
            message: ReconfigMessage::AckStartEpoch(AckStartEpoch {
                service_name: svc(),
                epoch: Epoch::new(epoch),
            }),
        });
    }

    fn ack_stop_from(fixture: &mut Fixture, node: &str, epoch: u32, checkpoint: &'static [u8]) {
        fixture.reconfigurator.handle_protocol(Envelope {
            sender: NodeId::new(node),
            message: ReconfigMessage::AckStopEpoch(AckStopEpoch {
                service_name: svc(),
                epoch: Epoch::new(epoch),
                final_state: Some(Bytes::from_static(checkpoint)),
            }),
        });
    }

    fn ack_drop_from(fixture: &mut Fixture, node: &str, epoch: u32) {
        fixture.reconfigurator.handle_protocol(Envelope {
            sender: NodeId::new(node),
            message: ReconfigMessage::AckDropEpochFinalState(AckDropEpochFinalState {
                service_name: svc(),
                epoch: Epoch::new(epoch),
            }),
        });
    }

    /// Drives a fixture's record for `svc` to READY at epoch 0 on {a, b, c}.
    async fn create_ready_record(fixture: &mut Fixture) -> tokio::sync::oneshot::Receiver<Result<(), ControlError>> {
        let (callback, rx) = Callback::new();
        fixture
            .reconfigurator
            .handle_create(svc(), group(&["a", "b", "c"]), Bytes::from_static(b"v0"), callback);

        for node in ["a", "b", "c"] {
            match expect_message(fixture, node).await {
                ReconfigMessage::StartEpoch(m) => {
                    assert_eq!(m.epoch, Epoch::initial());
                    assert_eq!(m.initial_state, Some(Bytes::from_static(b"v0")));
                }
                other => panic!("expected StartEpoch, got {:?}", other),
            }
        }

        ack_start_from(fixture, "a", 0);
        ack_start_from(fixture, "b", 0);
        rx
    }

    #[tokio::test]
    async fn create_completes_on_majority_start_acks() {
        let mut fixture = fixture();
        let rx = create_ready_record(&mut fixture).await;

        rx.await.unwrap().unwrap();
        let record = fixture.reconfigurator.record(&svc()).unwrap();
        assert_eq!(record.state, RecordState::Ready);
        assert_eq!(record.epoch, Epoch::initial());
        assert_eq!(record.actives, group(&["a", "b", "c"]));
    }

    #[tokio::test]
    async fn create_validation_errors() {
        let mut fixture = fixture();

        let (callback, rx) = Callback::new();
        fixture
            .reconfigurator
            .handle_create(svc(), BTreeSet::new(), Bytes::new(), callback);
        assert!(matches!(rx.await.unwrap(), Err(ControlError::InvalidConfig(_))));

        let (callback, rx) = Callback::new();
        fixture
            .reconfigurator
            .handle_create(svc(), group(&["ghost"]), Bytes::new(), callback);
        assert!(matches!(rx.await.unwrap(), Err(ControlError::InvalidConfig(_))));

        let (callback, rx) = Callback::new();
        fixture.reconfigurator.handle_delete(svc(), callback);
        assert!(matches!(rx.await.unwrap(), Err(ControlError::NotFound(_))));
    }

    #[tokio::test]
    async fn duplicate_create_gets_already_exists() {
        let mut fixture = fixture();
        let rx = create_ready_record(&mut fixture).await;
        rx.await.unwrap().unwrap();

        let (callback, rx) = Callback::new();
        fixture
            .reconfigurator
            .handle_create(svc(), group(&["a", "b", "c"]), Bytes::from_static(b"v0"), callback);
        assert!(matches!(rx.await.unwrap(), Err(ControlError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn change_replicas_full_protocol_walk() {
        let mut fixture = fixture();
        let rx = create_ready_record(&mut fixture).await;
        rx.await.unwrap().unwrap();

        let (callback, change_rx) = Callback::new();
        fixture
            .reconfigurator
            .handle_change_replicas(svc(), group(&["b", "c", "d"]), callback);

        for node in ["a", "b", "c"] {
            match expect_message(&mut fixture, node).await {
                ReconfigMessage::StopEpoch(m) => assert_eq!(m.epoch, Epoch::initial()),
                other => panic!("expected StopEpoch, got {:?}", other),
            }
        }

        // Any single stop ack advances the record; the epoch bumps.
        ack_stop_from(&mut fixture, "b", 0, b"ckpt");
        let record = fixture.reconfigurator.record(&svc()).unwrap();
        assert_eq!(record.state, RecordState::WaitAckStart);
        assert_eq!(record.epoch, Epoch::new(1));
        assert_eq!(record.actives, group(&["b", "c", "d"]));

        // A duplicate stop ack is a no-op: the machine has moved past
        // WAIT_ACK_STOP.
        ack_stop_from(&mut fixture, "c", 0, b"other");
        let record = fixture.reconfigurator.record(&svc()).unwrap();
        assert_eq!(record.state, RecordState::WaitAckStart);
        assert_eq!(record.epoch, Epoch::new(1));
        assert_eq!(record.stop_checkpoint, Some(Bytes::from_static(b"ckpt")));

        for node in ["b", "c", "d"] {
            match expect_message(&mut fixture, node).await {
                ReconfigMessage::StartEpoch(m) => {
                    assert_eq!(m.epoch, Epoch::new(1));
                    assert_eq!(m.prev_epoch_group, group(&["a", "b", "c"]));
                    assert_eq!(m.initial_state, None);
                }
                other => panic!("expected StartEpoch, got {:?}", other),
            }
        }

        ack_start_from(&mut fixture, "b", 1);
        ack_start_from(&mut fixture, "c", 1);

        // Majority started: the old group gets DropEpochFinalState(0).
        for node in ["a", "b", "c"] {
            match expect_message(&mut fixture, node).await {
                ReconfigMessage::DropEpochFinalState(m) => assert_eq!(m.epoch, Epoch::initial()),
                other => panic!("expected DropEpochFinalState, got {:?}", other),
            }
        }

        ack_drop_from(&mut fixture, "a", 0);
        ack_drop_from(&mut fixture, "b", 0);
        // Not yet: drops require every prior member.
        assert_eq!(
            fixture.reconfigurator.record(&svc()).unwrap().state,
            RecordState::WaitAckDrop
        );
        ack_drop_from(&mut fixture, "c", 0);

        change_rx.await.unwrap().unwrap();
        let record = fixture.reconfigurator.record(&svc()).unwrap();
        assert_eq!(record.state, RecordState::Ready);
        assert_eq!(record.epoch, Epoch::new(1));
        assert!(record.prev_actives.is_empty());
    }

    #[tokio::test]
    async fn concurrent_change_is_busy() {
        let mut fixture = fixture();
        let rx = create_ready_record(&mut fixture).await;
        rx.await.unwrap().unwrap();

        let (callback, _change_rx) = Callback::new();
        fixture
            .reconfigurator
            .handle_change_replicas(svc(), group(&["b", "c", "d"]), callback);

        let (callback, busy_rx) = Callback::new();
        fixture
            .reconfigurator
            .handle_change_replicas(svc(), group(&["a", "b", "d"]), callback);
        assert!(matches!(busy_rx.await.unwrap(), Err(ControlError::Busy(_))));

        let (callback, busy_rx) = Callback::new();
        fixture.reconfigurator.handle_delete(svc(), callback);
        assert!(matches!(busy_rx.await.unwrap(), Err(ControlError::Busy(_))));
    }

    #[tokio::test]
    async fn delete_walks_stop_then_drop_and_removes_record() {
        let mut fixture = fixture();
        let rx = create_ready_record(&mut fixture).await;
        rx.await.unwrap().unwrap();

        let (callback, delete_rx) = Callback::new();
        fixture.reconfigurator.handle_delete(svc(), callback);

        for node in ["a", "b", "c"] {
            match expect_message(&mut fixture, node).await {
                ReconfigMessage::StopEpoch(m) => assert_eq!(m.epoch, Epoch::initial()),
                other => panic!("expected StopEpoch, got {:?}", other),
            }
        }

        ack_stop_from(&mut fixture, "a", 0, b"final");
        // Delete goes straight to the drop phase; there is no new group.
        assert_eq!(
            fixture.reconfigurator.record(&svc()).unwrap().state,
            RecordState::WaitAckDrop
        );

        for node in ["a", "b", "c"] {
            match expect_message(&mut fixture, node).await {
                ReconfigMessage::DropEpochFinalState(m) => assert_eq!(m.epoch, Epoch::initial()),
                other => panic!("expected DropEpochFinalState, got {:?}", other),
            }
        }

        ack_drop_from(&mut fixture, "a", 0);
        ack_drop_from(&mut fixture, "b", 0);
        ack_drop_from(&mut fixture, "c", 0);

        delete_rx.await.unwrap().unwrap();
        assert!(fixture.reconfigurator.record(&svc()).is_none());

        let (callback, rx) = Callback::new();
        fixture.reconfigurator.handle_request_actives(svc(), callback);
        assert!(matches!(rx.await.unwrap(), Err(ControlError::NotFound(_))));
    }

    #[tokio::test]
    async fn request_actives_snapshots_pre_change_group_mid_transition() {
        let mut fixture = fixture();
        let rx = create_ready_record(&mut fixture).await;
        rx.await.unwrap().unwrap();

        let (callback, _change_rx) = Callback::new();
        fixture
            .reconfigurator
            .handle_change_replicas(svc(), group(&["b", "c", "d"]), callback);

        // Mid WAIT_ACK_STOP the snapshot still shows the old group; the race
        // is explicitly permitted.
        let (callback, rx) = Callback::new();
        fixture.reconfigurator.handle_request_actives(svc(), callback);
        let view = rx.await.unwrap().unwrap();
        assert_eq!(view.epoch, Epoch::initial());
        assert_eq!(view.actives, group(&["a", "b", "c"]));
    }

    #[tokio::test]
    async fn restart_replays_desired_messages_from_the_store() {
        let store = Arc::new(MemoryControlStore::new());
        let mut fixture = fixture_with_store(store.clone());
        let rx = create_ready_record(&mut fixture).await;
        rx.await.unwrap().unwrap();

        let (callback, _change_rx) = Callback::new();
        fixture
            .reconfigurator
            .handle_change_replicas(svc(), group(&["b", "c", "d"]), callback);
        ack_stop_from(&mut fixture, "a", 0, b"ckpt");
        assert_eq!(
            fixture.reconfigurator.record(&svc()).unwrap().state,
            RecordState::WaitAckStart
        );

        // "Crash": rebuild the reconfigurator over the same durable store.
        // Recovery re-emits the StartEpoch(1) wave with identical contents.
        let mut replayed = fixture_with_store(store);
        for node in ["b", "c", "d"] {
            match expect_message(&mut replayed, node).await {
                ReconfigMessage::StartEpoch(m) => {
                    assert_eq!(m.epoch, Epoch::new(1));
                    assert_eq!(m.members, group(&["b", "c", "d"]));
                    assert_eq!(m.prev_epoch_group, group(&["a", "b", "c"]));
                }
                other => panic!("expected StartEpoch, got {:?}", other),
            }
        }
        let record = replayed.reconfigurator.record(&svc()).unwrap();
        assert_eq!(record.state, RecordState::WaitAckStart);
        assert_eq!(record.epoch, Epoch::new(1));
    }

    #[tokio::test]
    async fn start_acks_from_non_members_and_stale_epochs_are_ignored() {
        let mut fixture = fixture();
        let (callback, _rx) = Callback::new();
        fixture
            .reconfigurator
            .handle_create(svc(), group(&["a", "b", "c"]), Bytes::new(), callback);

        // Not a member of the group.
        ack_start_from(&mut fixture, "d", 0);
        // Wrong epoch.
        ack_start_from(&mut fixture, "a", 7);
        assert_eq!(
            fixture.reconfigurator.record(&svc()).unwrap().state,
            RecordState::WaitAckStart
        );

        // One valid ack alone is not a majority of three.
        ack_start_from(&mut fixture, "a", 0);
        assert_eq!(
            fixture.reconfigurator.record(&svc()).unwrap().state,
            RecordState::WaitAckStart
        );
    }

    /// Policy that proposes moving any name to {a, b, d} once demand crosses
    /// a threshold.
    struct RelocatingPolicy;

    impl crate::demand::DemandPolicy for RelocatingPolicy {
        fn register(&self, profile: &mut DemandProfile, _sender: Option<&NodeId>) {
            profile.request_count += 1;
        }

        fn should_report(&self, _profile: &DemandProfile) -> bool {
            true
        }

        fn combine(&self, into: &mut DemandProfile, other: &DemandProfile) {
            into.request_count += other.request_count;
        }

        fn should_reconfigure(
            &self,
            profile: &DemandProfile,
            _current_actives: &BTreeSet<NodeId>,
        ) -> Option<BTreeSet<NodeId>> {
            (profile.request_count >= 3).then(|| group(&["a", "b", "d"]))
        }
    }

    #[tokio::test]
    async fn demand_report_can_induce_a_change() {
        let mut fixture = fixture_with(Arc::new(MemoryControlStore::new()), Arc::new(RelocatingPolicy));

        let rx = create_ready_record(&mut fixture).await;
        rx.await.unwrap().unwrap();

        let mut profile = DemandProfile::new(svc());
        profile.request_count = 5;
        fixture.reconfigurator.handle_protocol(Envelope {
            sender: NodeId::new("a"),
            message: ReconfigMessage::DemandReport(DemandReport {
                service_name: svc(),
                epoch: Epoch::initial(),
                profile: profile.encode(),
            }),
        });

        // The policy's proposal kicked off an ordinary change.
        let record = fixture.reconfigurator.record(&svc()).unwrap();
        assert_eq!(record.state, RecordState::WaitAckStop);
        assert_eq!(record.new_actives, Some(group(&["a", "b", "d"])));
    }

    #[tokio::test]
    async fn node_config_bootstrap_and_identity() {
        let fixture = fixture();

        let record = fixture
            .reconfigurator
            .record(&ServiceName::node_config())
            .unwrap();
        assert_eq!(record.state, RecordState::Ready);
        assert_eq!(record.epoch, Epoch::initial());
        assert_eq!(record.actives, group(&["rc1"]));
        assert!(fixture.store.read_rc_record(&ServiceName::node_config()).is_some());
    }

    #[tokio::test]
    async fn removing_the_last_reconfigurator_is_invalid() {
        let mut fixture = fixture();

        let (callback, rx) = Callback::new();
        fixture.reconfigurator.handle_node_config_change(
            BTreeSet::new(),
            group(&["rc1"]),
            callback,
        );
        assert!(matches!(rx.await.unwrap(), Err(ControlError::InvalidConfig(_))));
    }
}
