use crate::messages::{Envelope, ReconfigMessage};
use crate::messenger::Messenger;
use crate::node::{Epoch, NodeId, ServiceName};
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio::time::Duration;

/// ProtocolTasks runs one retransmitting task per outstanding
/// acknowledgement. Tasks never write durable state; they re-send messages
/// that reflect state already durably recorded by their spawner, so a crash
/// of the task (or the whole process) loses nothing that a respawn-on-replay
/// cannot restore.
///
/// A task is keyed by `Type:name:epoch`. Spawn is idempotent on the key: a
/// second spawner attaches as a notifiee of the running task instead of
/// creating a duplicate. Tasks end by explicit cancellation, never timeout.
pub struct ProtocolTasks {
    logger: slog::Logger,
    my_node_id: NodeId,
    messenger: Arc<dyn Messenger>,
    intervals: RestartIntervals,
    table: Arc<Mutex<HashMap<String, RunningTask>>>,
}

/// Bounded-exponential restart schedule: first retransmit after `initial`,
/// doubling up to `cap`.
#[derive(Copy, Clone, Debug)]
pub struct RestartIntervals {
    pub initial: Duration,
    pub cap: Duration,
}

impl RestartIntervals {
    pub fn capped_at(cap: Duration) -> Self {
        RestartIntervals {
            initial: std::cmp::min(Duration::from_millis(500), cap),
            cap,
        }
    }

    fn next(self, current: Duration) -> Duration {
        std::cmp::min(current * 2, self.cap)
    }
}

struct RunningTask {
    cancel: oneshot::Sender<()>,
    notifiees: Vec<NodeId>,
}

/// Outcome of a spawn attempt.
#[derive(Debug, Eq, PartialEq)]
pub enum Spawned {
    Fresh,
    AttachedToRunning,
}

pub fn task_key(kind: &str, name: &ServiceName, epoch: Epoch) -> String {
    format!("{}:{}:{}", kind, name, epoch)
}

impl ProtocolTasks {
    pub fn new(
        logger: slog::Logger,
        my_node_id: NodeId,
        messenger: Arc<dyn Messenger>,
        intervals: RestartIntervals,
    ) -> Self {
        ProtocolTasks {
            logger,
            my_node_id,
            messenger,
            intervals,
            table: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Spawns a task that retransmits `message` to every member of `targets`
    /// each round. Used for StopEpoch / StartEpoch / DropEpochFinalState,
    /// where re-sending to already-acked members is harmless (receivers are
    /// idempotent and the reconfigurator dedups acks).
    pub fn spawn_retransmit(
        &self,
        key: String,
        targets: Vec<NodeId>,
        message: ReconfigMessage,
        notifiee: Option<NodeId>,
    ) -> Spawned {
        self.spawn_inner(key, notifiee, TargetPlan::Broadcast(targets), message)
    }

    /// Spawns a task that retransmits `message` to one member per round,
    /// rotating round-robin from a random starting point. Used for the
    /// peer-to-peer final-state fetch.
    pub fn spawn_round_robin(
        &self,
        key: String,
        targets: Vec<NodeId>,
        message: ReconfigMessage,
        notifiee: Option<NodeId>,
    ) -> Spawned {
        self.spawn_inner(key, notifiee, TargetPlan::RoundRobin(targets), message)
    }

    fn spawn_inner(
        &self,
        key: String,
        notifiee: Option<NodeId>,
        plan: TargetPlan,
        message: ReconfigMessage,
    ) -> Spawned {
        let mut table = self.table.lock().expect("protocol task table mutex poison");

        if let Some(running) = table.get_mut(&key) {
            if let Some(notifiee) = notifiee {
                if !running.notifiees.contains(&notifiee) {
                    running.notifiees.push(notifiee);
                }
            }
            return Spawned::AttachedToRunning;
        }

        let (cancel_tx, cancel_rx) = oneshot::channel();
        table.insert(
            key.clone(),
            RunningTask {
                cancel: cancel_tx,
                notifiees: notifiee.into_iter().collect(),
            },
        );
        drop(table);

        slog::debug!(self.logger, "Spawning protocol task '{}'", key);
        tokio::task::spawn(Self::retransmit_task(
            self.logger.new(slog::o!("ProtocolTask" => key)),
            self.my_node_id.clone(),
            self.messenger.clone(),
            self.intervals,
            plan,
            message,
            cancel_rx,
        ));

        Spawned::Fresh
    }

    pub fn is_running(&self, key: &str) -> bool {
        self.table
            .lock()
            .expect("protocol task table mutex poison")
            .contains_key(key)
    }

    /// Cancels the task and returns its attached notifiees, or None if no
    /// task was running under the key. Cancellation is the only way a task
    /// ends; the satisfying event (matching ack, superseding drop) calls
    /// this.
    pub fn cancel(&self, key: &str) -> Option<Vec<NodeId>> {
        let removed = self
            .table
            .lock()
            .expect("protocol task table mutex poison")
            .remove(key);

        removed.map(|running| {
            // Receiver sees the sender drop; an explicit send is not needed.
            drop(running.cancel);
            running.notifiees
        })
    }

    async fn retransmit_task(
        logger: slog::Logger,
        my_node_id: NodeId,
        messenger: Arc<dyn Messenger>,
        intervals: RestartIntervals,
        plan: TargetPlan,
        message: ReconfigMessage,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let mut round_robin_index = match &plan {
            TargetPlan::Broadcast(_) => 0,
            TargetPlan::RoundRobin(targets) if targets.is_empty() => 0,
            TargetPlan::RoundRobin(targets) => rand::thread_rng().gen_range(0..targets.len()),
        };
        let mut interval = intervals.initial;

        loop {
            Self::send_round(&logger, &my_node_id, &*messenger, &plan, &mut round_robin_index, &message).await;

            tokio::select! {
                _ = &mut cancel_rx => {
                    return;
                }
                _ = tokio::time::sleep(interval) => {
                    interval = intervals.next(interval);
                }
            }
        }
    }

    async fn send_round(
        logger: &slog::Logger,
        my_node_id: &NodeId,
        messenger: &dyn Messenger,
        plan: &TargetPlan,
        round_robin_index: &mut usize,
        message: &ReconfigMessage,
    ) {
        let targets: Vec<&NodeId> = match plan {
            TargetPlan::Broadcast(targets) => targets.iter().collect(),
            TargetPlan::RoundRobin(targets) => {
                if targets.is_empty() {
                    return;
                }
                let target = &targets[*round_robin_index % targets.len()];
                *round_robin_index += 1;
                vec![target]
            }
        };

        for target in targets {
            let envelope = Envelope {
                sender: my_node_id.clone(),
                message: message.clone(),
            };
            if let Err(send_err) = messenger.send(target, envelope).await {
                // Loss is repaired by the next round.
                slog::debug!(logger, "Send to {:?} failed: {}", target, send_err);
            }
        }
    }
}

enum TargetPlan {
    Broadcast(Vec<NodeId>),
    RoundRobin(Vec<NodeId>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::StopEpoch;
    use crate::messenger::SendError;
    use tokio::sync::mpsc;

    struct CapturingMessenger {
        tx: mpsc::UnboundedSender<(NodeId, Envelope)>,
    }

    #[async_trait::async_trait]
    impl Messenger for CapturingMessenger {
        async fn send(&self, to: &NodeId, envelope: Envelope) -> Result<(), SendError> {
            self.tx
                .send((to.clone(), envelope))
                .map_err(|_| SendError::Unreachable(to.clone().into_inner()))
        }
    }

    fn test_fixture(
        intervals: RestartIntervals,
    ) -> (ProtocolTasks, mpsc::UnboundedReceiver<(NodeId, Envelope)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let tasks = ProtocolTasks::new(
            logger,
            NodeId::new("me"),
            Arc::new(CapturingMessenger { tx }),
            intervals,
        );
        (tasks, rx)
    }

    fn stop_message() -> ReconfigMessage {
        ReconfigMessage::StopEpoch(StopEpoch {
            service_name: ServiceName::new("svc"),
            epoch: Epoch::new(4),
        })
    }

    // Long enough that only the immediate first round happens during a test.
    fn quiescent_intervals() -> RestartIntervals {
        RestartIntervals {
            initial: Duration::from_secs(600),
            cap: Duration::from_secs(600),
        }
    }

    #[tokio::test]
    async fn first_round_is_sent_immediately() {
        let (tasks, mut rx) = test_fixture(quiescent_intervals());

        let spawned = tasks.spawn_retransmit(
            task_key("StopEpoch", &ServiceName::new("svc"), Epoch::new(4)),
            vec![NodeId::new("a1"), NodeId::new("a2")],
            stop_message(),
            None,
        );
        assert_eq!(spawned, Spawned::Fresh);

        let (to1, _) = rx.recv().await.unwrap();
        let (to2, _) = rx.recv().await.unwrap();
        let mut recipients = vec![to1, to2];
        recipients.sort();
        assert_eq!(recipients, vec![NodeId::new("a1"), NodeId::new("a2")]);
    }

    #[tokio::test]
    async fn spawn_is_idempotent_and_attaches_notifiees() {
        let (tasks, _rx) = test_fixture(quiescent_intervals());
        let key = task_key("fetch", &ServiceName::new("svc"), Epoch::new(1));

        let first = tasks.spawn_round_robin(
            key.clone(),
            vec![NodeId::new("a1")],
            stop_message(),
            Some(NodeId::new("rc1")),
        );
        let second = tasks.spawn_round_robin(
            key.clone(),
            vec![NodeId::new("a1")],
            stop_message(),
            Some(NodeId::new("rc2")),
        );
        let duplicate = tasks.spawn_round_robin(
            key.clone(),
            vec![NodeId::new("a1")],
            stop_message(),
            Some(NodeId::new("rc2")),
        );

        assert_eq!(first, Spawned::Fresh);
        assert_eq!(second, Spawned::AttachedToRunning);
        assert_eq!(duplicate, Spawned::AttachedToRunning);

        let notifiees = tasks.cancel(&key).unwrap();
        assert_eq!(notifiees, vec![NodeId::new("rc1"), NodeId::new("rc2")]);
        assert!(!tasks.is_running(&key));
    }

    #[tokio::test]
    async fn cancel_stops_retransmission() {
        let (tasks, mut rx) = test_fixture(quiescent_intervals());
        let key = task_key("StopEpoch", &ServiceName::new("svc"), Epoch::new(4));

        tasks.spawn_retransmit(key.clone(), vec![NodeId::new("a1")], stop_message(), None);
        rx.recv().await.unwrap();

        assert!(tasks.cancel(&key).is_some());
        assert!(tasks.cancel(&key).is_none());

        // The task ends without another round; channel closes when the
        // messenger side is dropped by the exiting task.
        tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .expect_err("Expected no further retransmission");
    }

    #[tokio::test]
    async fn round_robin_rotates_through_targets() {
        let intervals = RestartIntervals {
            initial: Duration::from_millis(10),
            cap: Duration::from_millis(10),
        };
        let (tasks, mut rx) = test_fixture(intervals);
        let key = task_key("fetch", &ServiceName::new("svc"), Epoch::new(0));
        let targets = vec![NodeId::new("a1"), NodeId::new("a2"), NodeId::new("a3")];

        tasks.spawn_round_robin(key.clone(), targets.clone(), stop_message(), None);

        let mut recipients = Vec::new();
        for _ in 0..3 {
            let (to, _) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("Expected a retransmission round")
                .unwrap();
            recipients.push(to);
        }
        tasks.cancel(&key);

        // Three consecutive rounds hit three distinct members, whatever the
        // random starting point was.
        recipients.sort();
        recipients.dedup();
        assert_eq!(recipients.len(), 3);
    }

    #[test]
    fn backoff_doubles_to_cap() {
        let intervals = RestartIntervals::capped_at(Duration::from_secs(4));
        assert_eq!(intervals.initial, Duration::from_millis(500));
        let next = intervals.next(intervals.initial);
        assert_eq!(next, Duration::from_secs(1));
        assert_eq!(intervals.next(Duration::from_secs(3)), Duration::from_secs(4));
        assert_eq!(intervals.next(Duration::from_secs(4)), Duration::from_secs(4));

        let tight = RestartIntervals::capped_at(Duration::from_millis(200));
        assert_eq!(tight.initial, Duration::from_millis(200));
    }
}
