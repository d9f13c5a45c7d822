pub mod propagation_task_store;

use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use crate::delivery::delivery_config::DeliveryConfig;
use crate::delivery::propagation::propagation_task_store::{PropagationTask, PropagationTaskStore};
use crate::messaging::node_id::NodeIdentity;
use crate::messaging::rpc::NeighborSender;
use crate::messaging::stream_message::StreamMessage;


/// Gossips newly seen messages to neighbors.
///
/// A message is sent to all current neighbors right away. Sends are fire-and-forget, failures are
///  only logged. The message's propagation task stays around until it was successfully sent to
///  `min_propagation_targets` neighbors, and while it is around, neighbors that join later get the
///  message as well.
///
/// Tasks are purely time and capacity bounded, so there is nothing to stop.
pub struct Propagation<N: NodeIdentity, S: NeighborSender<N>> {
    min_propagation_targets: usize,
    sender: Arc<S>,
    tasks: Arc<Mutex<PropagationTaskStore<N>>>,
}

impl<N: NodeIdentity, S: NeighborSender<N>> Propagation<N, S> {
    pub fn new(config: &DeliveryConfig, sender: Arc<S>) -> Propagation<N, S> {
        Propagation {
            min_propagation_targets: config.min_propagation_targets,
            sender,
            tasks: Arc::new(Mutex::new(PropagationTaskStore::new(config.propagation_task_ttl, config.max_propagation_tasks))),
        }
    }

    /// NB: This does not block on any send, it only spawns them
    pub fn feed_unseen_message(&self, message: Arc<StreamMessage>, targets: &[N], source: Option<N>) {
        trace!(message = %message.message_id.message_ref, num_targets = targets.len(), ?source, "propagating message");

        if self.min_propagation_targets > 0 {
            self.tasks.lock().unwrap()
                .add(PropagationTask::new(message.clone(), source.clone()));
        }

        for target in targets {
            if source.as_ref() == Some(target) {
                continue;
            }
            self.send_and_mark(message.clone(), target.clone());
        }
    }

    /// sends all messages that are still being propagated (and were not sent to the new neighbor
    ///  before) to a new neighbor
    pub fn on_neighbor_joined(&self, neighbor: &N) {
        let pending = self.tasks.lock().unwrap()
            .get()
            .into_iter()
            .filter(|task| task.is_pending_for(neighbor))
            .map(|task| task.message.clone())
            .collect::<Vec<_>>();

        if !pending.is_empty() {
            debug!(?neighbor, num_messages = pending.len(), "replaying pending messages to new neighbor");
        }

        for message in pending {
            self.send_and_mark(message, neighbor.clone());
        }
    }

    pub fn num_pending_tasks(&self) -> usize {
        self.tasks.lock().unwrap()
            .get()
            .len()
    }

    fn send_and_mark(&self, message: Arc<StreamMessage>, neighbor: N) {
        let sender = self.sender.clone();
        let tasks = self.tasks.clone();
        let min_propagation_targets = self.min_propagation_targets;

        tokio::spawn(async move {
            if let Err(e) = sender.send_to_neighbor(&neighbor, &message).await {
                debug!(?neighbor, message = %message.message_id.message_ref, "sending message to neighbor failed: {}", e);
                return;
            }

            let mut tasks = tasks.lock().unwrap();
            let message_id = &message.message_id;
            let is_done = match tasks.get_mut(message_id) {
                Some(task) => {
                    task.handled_neighbors.insert(neighbor);
                    task.handled_neighbors.len() >= min_propagation_targets
                }
                None => false,
            };
            if is_done {
                trace!(message = %message_id.message_ref, "message reached enough neighbors");
                tasks.delete(message_id);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::node_id::NodeId;
    use crate::test_util::message::test_message;
    use crate::test_util::rpc::TrackingMockRpc;
    use std::time::Duration;
    use tokio::time;
    use tokio::time::sleep;

    fn node(number: u16) -> NodeId {
        NodeId::from_number(number)
    }

    fn propagation(min_propagation_targets: usize, rpc: Arc<TrackingMockRpc>) -> Propagation<NodeId, TrackingMockRpc> {
        let mut config = DeliveryConfig::new();
        config.min_propagation_targets = min_propagation_targets;
        Propagation::new(&config, rpc)
    }

    #[tokio::test]
    async fn test_feed_skips_source() {
        time::pause();

        let rpc = Arc::new(TrackingMockRpc::new());
        let propagation = propagation(2, rpc.clone());

        propagation.feed_unseen_message(Arc::new(test_message(1)), &[node(1), node(2), node(3)], Some(node(2)));
        sleep(Duration::from_millis(10)).await;

        let mut sent_to = rpc.stream_messages().await.into_iter()
            .map(|(to, _)| to)
            .collect::<Vec<_>>();
        sent_to.sort();
        assert_eq!(sent_to, vec![node(1), node(3)]);

        // two successes retire the task
        assert_eq!(propagation.num_pending_tasks(), 0);
    }

    #[tokio::test]
    async fn test_task_stays_pending_until_enough_successes() {
        time::pause();

        let rpc = Arc::new(TrackingMockRpc::new());
        rpc.fail_sends_to(node(2)).await;
        let propagation = propagation(3, rpc.clone());

        propagation.feed_unseen_message(Arc::new(test_message(1)), &[node(1), node(2)], None);
        sleep(Duration::from_millis(10)).await;
        assert_eq!(propagation.num_pending_tasks(), 1);

        // the failed neighbor is retried when it joins again
        propagation.on_neighbor_joined(&node(2));
        sleep(Duration::from_millis(10)).await;
        assert_eq!(rpc.stream_messages_to(node(2)).await, 2);
        assert_eq!(propagation.num_pending_tasks(), 1);

        // no resend to a neighbor that was already reached
        propagation.on_neighbor_joined(&node(1));
        sleep(Duration::from_millis(10)).await;
        assert_eq!(rpc.stream_messages_to(node(1)).await, 1);

        propagation.on_neighbor_joined(&node(3));
        propagation.on_neighbor_joined(&node(4));
        sleep(Duration::from_millis(10)).await;
        assert_eq!(propagation.num_pending_tasks(), 0);

        // three successes: the task is gone
        propagation.on_neighbor_joined(&node(5));
        sleep(Duration::from_millis(10)).await;
        assert_eq!(rpc.stream_messages_to(node(5)).await, 0);
    }

    #[tokio::test]
    async fn test_neighbor_joined_only_while_fewer_than_min_successes() {
        time::pause();

        let rpc = Arc::new(TrackingMockRpc::new());
        let propagation = propagation(3, rpc.clone());

        propagation.feed_unseen_message(Arc::new(test_message(1)), &[node(1), node(2)], None);
        sleep(Duration::from_millis(10)).await;

        propagation.on_neighbor_joined(&node(4));
        sleep(Duration::from_millis(10)).await;
        assert_eq!(rpc.stream_messages_to(node(4)).await, 1);

        propagation.on_neighbor_joined(&node(5));
        sleep(Duration::from_millis(10)).await;
        assert_eq!(rpc.stream_messages_to(node(5)).await, 0);
    }

    #[tokio::test]
    async fn test_neighbor_joined_skips_source() {
        time::pause();

        let rpc = Arc::new(TrackingMockRpc::new());
        let propagation = propagation(2, rpc.clone());

        propagation.feed_unseen_message(Arc::new(test_message(1)), &[], Some(node(1)));
        propagation.on_neighbor_joined(&node(1));
        sleep(Duration::from_millis(10)).await;

        assert!(rpc.stream_messages().await.is_empty());
        assert_eq!(propagation.num_pending_tasks(), 1);
    }

    #[tokio::test]
    async fn test_zero_min_targets_is_fire_and_forget() {
        time::pause();

        let rpc = Arc::new(TrackingMockRpc::new());
        let propagation = propagation(0, rpc.clone());

        propagation.feed_unseen_message(Arc::new(test_message(1)), &[node(1)], None);
        sleep(Duration::from_millis(10)).await;
        assert_eq!(propagation.num_pending_tasks(), 0);

        propagation.on_neighbor_joined(&node(2));
        sleep(Duration::from_millis(10)).await;
        assert_eq!(rpc.stream_messages_to(node(1)).await, 1);
        assert_eq!(rpc.stream_messages_to(node(2)).await, 0);
    }

    #[tokio::test]
    async fn test_expired_tasks_are_not_replayed() {
        time::pause();

        let rpc = Arc::new(TrackingMockRpc::new());
        let propagation = propagation(2, rpc.clone());

        propagation.feed_unseen_message(Arc::new(test_message(1)), &[], None);
        time::advance(DeliveryConfig::new().propagation_task_ttl).await;

        propagation.on_neighbor_joined(&node(1));
        sleep(Duration::from_millis(10)).await;
        assert!(rpc.stream_messages().await.is_empty());
    }

    #[tokio::test]
    async fn test_replay_sends_all_pending_messages() {
        time::pause();

        let rpc = Arc::new(TrackingMockRpc::new());
        let propagation = propagation(2, rpc.clone());

        for ts in 1..=3 {
            propagation.feed_unseen_message(Arc::new(test_message(ts)), &[], None);
        }
        propagation.on_neighbor_joined(&node(1));
        sleep(Duration::from_millis(10)).await;

        let mut timestamps = rpc.stream_messages().await.into_iter()
            .map(|(_, message_ref)| message_ref.timestamp)
            .collect::<Vec<_>>();
        timestamps.sort();
        assert_eq!(timestamps, vec![1, 2, 3]);
        assert_eq!(propagation.num_pending_tasks(), 3);
    }
}
