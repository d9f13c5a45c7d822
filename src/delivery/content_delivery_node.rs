use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::delivery::content_delivery_rpc_local::{ContentDeliveryRpcLocal, StreamPartDelivery};
use crate::delivery::delivery_config::DeliveryConfig;
use crate::delivery::delivery_error::DeliveryError;
use crate::delivery::duplicate_detector::DuplicateDetectors;
use crate::delivery::neighbor_list::NeighborList;
use crate::delivery::propagation::Propagation;
use crate::messaging::node_id::NodeIdentity;
use crate::messaging::rpc::{ContentDeliveryRpc, NeighborSender};
use crate::messaging::stream_message::{StreamMessage, StreamPartId};


/// Propagation targets must still be neighbors when a send actually happens
pub struct NeighborRpcSender<N: NodeIdentity, R: ContentDeliveryRpc<N>> {
    rpc: Arc<R>,
    neighbors: Arc<Mutex<NeighborList<N>>>,
}

#[async_trait]
impl<N: NodeIdentity, R: ContentDeliveryRpc<N>> NeighborSender<N> for NeighborRpcSender<N, R> {
    async fn send_to_neighbor(&self, neighbor: &N, message: &StreamMessage) -> anyhow::Result<()> {
        let is_neighbor = self.neighbors.lock().unwrap().contains(neighbor);
        if !is_neighbor {
            return Err(anyhow!("propagation target not found"));
        }
        self.rpc.send_stream_message(neighbor, message).await
    }
}

/// A node's participation in one stream partition's overlay graph. The neighbors are managed by
///  the discovery layer, which reports them through [ContentDeliveryNode::add_neighbor] and
///  [ContentDeliveryNode::remove_neighbor].
pub struct ContentDeliveryNode<N: NodeIdentity, R: ContentDeliveryRpc<N>> {
    stream_part_id: StreamPartId,
    rpc: Arc<R>,
    neighbors: Arc<Mutex<NeighborList<N>>>,
    duplicate_detectors: Mutex<DuplicateDetectors>,
    propagation: Propagation<N, NeighborRpcSender<N, R>>,
    messages: broadcast::Sender<Arc<StreamMessage>>,
}

impl<N: NodeIdentity, R: ContentDeliveryRpc<N>> ContentDeliveryNode<N, R> {
    pub fn new(config: &DeliveryConfig, stream_part_id: StreamPartId, local_node: N, rpc: Arc<R>) -> ContentDeliveryNode<N, R> {
        let neighbors = Arc::new(Mutex::new(NeighborList::new(local_node, config.max_neighbors)));
        let sender = Arc::new(NeighborRpcSender {
            rpc: rpc.clone(),
            neighbors: neighbors.clone(),
        });

        let (messages, _) = broadcast::channel(config.message_channel_capacity);

        ContentDeliveryNode {
            stream_part_id,
            rpc,
            neighbors,
            duplicate_detectors: Mutex::new(DuplicateDetectors::new(config.max_gap_count)),
            propagation: Propagation::new(config, sender),
            messages,
        }
    }

    pub fn rpc_local(self: &Arc<Self>) -> ContentDeliveryRpcLocal<N, Self> {
        ContentDeliveryRpcLocal::new(self.clone())
    }

    /// all messages delivered in this stream partition, both local and remote
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<StreamMessage>> {
        self.messages.subscribe()
    }

    pub fn add_neighbor(&self, node: N) {
        let added = self.neighbors.lock().unwrap().add(node.clone());
        if added {
            debug!(?node, stream_part = %self.stream_part_id, "neighbor added");
            self.propagation.on_neighbor_joined(&node);
        }
    }

    pub fn remove_neighbor(&self, node: &N) {
        if self.neighbors.lock().unwrap().remove(node) {
            debug!(?node, stream_part = %self.stream_part_id, "neighbor removed");
        }
    }

    pub fn get_neighbors(&self) -> Vec<N> {
        self.neighbors.lock().unwrap().ids()
    }

    /// notifies all neighbors that this node leaves the stream partition
    pub async fn stop(&self) {
        let neighbors = {
            let mut neighbors = self.neighbors.lock().unwrap();
            let ids = neighbors.ids();
            neighbors.clear();
            ids
        };

        for neighbor in neighbors {
            self.rpc.leave_stream_part_notice(&neighbor, &self.stream_part_id).await;
        }
    }
}

impl<N: NodeIdentity, R: ContentDeliveryRpc<N>> StreamPartDelivery<N> for ContentDeliveryNode<N, R> {
    fn stream_part_id(&self) -> &StreamPartId {
        &self.stream_part_id
    }

    fn mark_and_check(&self, message: &StreamMessage) -> Result<bool, DeliveryError> {
        self.duplicate_detectors.lock().unwrap()
            .mark_and_check(&message.message_id, message.previous_message_ref)
    }

    fn broadcast(&self, message: Arc<StreamMessage>, previous_node: Option<N>) -> Result<(), DeliveryError> {
        if previous_node.is_none() {
            // locally published: mark it so it is not processed again when it comes back
            self.mark_and_check(&message)?;
        }

        trace!(stream_part = %self.stream_part_id, message = %message.message_id.message_ref, "delivering message");
        // no subscribers is fine
        let _ = self.messages.send(message.clone());

        let targets = self.get_neighbors();
        self.propagation.feed_unseen_message(message, &targets, previous_node);
        Ok(())
    }

    fn on_leave_notice(self: &Arc<Self>, sender: &N) {
        self.remove_neighbor(sender);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::node_id::NodeId;
    use crate::test_util::message::{test_message, test_message_with_previous, test_stream_part_id};
    use crate::test_util::rpc::TrackingMockRpc;
    use std::time::Duration;
    use tokio::time;
    use tokio::time::sleep;

    fn node(number: u16) -> NodeId {
        NodeId::from_number(number)
    }

    fn content_delivery_node(rpc: Arc<TrackingMockRpc>) -> Arc<ContentDeliveryNode<NodeId, TrackingMockRpc>> {
        Arc::new(ContentDeliveryNode::new(&DeliveryConfig::new(), test_stream_part_id(), node(1), rpc))
    }

    #[tokio::test]
    async fn test_local_broadcast_reaches_neighbors_and_subscribers() {
        time::pause();

        let rpc = Arc::new(TrackingMockRpc::new());
        let delivery_node = content_delivery_node(rpc.clone());
        delivery_node.add_neighbor(node(2));
        delivery_node.add_neighbor(node(3));
        let mut subscriber = delivery_node.subscribe();

        delivery_node.broadcast(Arc::new(test_message(10)), None).unwrap();
        sleep(Duration::from_millis(10)).await;

        assert_eq!(subscriber.try_recv().unwrap().message_id.message_ref.timestamp, 10);
        assert_eq!(rpc.stream_messages_to(node(2)).await, 1);
        assert_eq!(rpc.stream_messages_to(node(3)).await, 1);
    }

    #[tokio::test]
    async fn test_inbound_message_is_not_sent_back() {
        time::pause();

        let rpc = Arc::new(TrackingMockRpc::new());
        let delivery_node = content_delivery_node(rpc.clone());
        delivery_node.add_neighbor(node(2));
        delivery_node.add_neighbor(node(3));
        let rpc_local = delivery_node.rpc_local();

        rpc_local.on_stream_message(test_message(10), node(2)).unwrap();
        // duplicate
        rpc_local.on_stream_message(test_message(10), node(3)).unwrap();
        sleep(Duration::from_millis(10)).await;

        assert_eq!(rpc.stream_messages().await, vec![(node(3), test_message(10).message_id.message_ref)]);
    }

    #[tokio::test]
    async fn test_locally_published_message_coming_back_is_a_duplicate() {
        time::pause();

        let rpc = Arc::new(TrackingMockRpc::new());
        let delivery_node = content_delivery_node(rpc.clone());
        delivery_node.add_neighbor(node(2));
        let mut subscriber = delivery_node.subscribe();

        delivery_node.broadcast(Arc::new(test_message(10)), None).unwrap();
        delivery_node.rpc_local().on_stream_message(test_message(10), node(2)).unwrap();
        sleep(Duration::from_millis(10)).await;

        assert!(subscriber.try_recv().is_ok());
        assert!(subscriber.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_new_neighbor_gets_pending_messages() {
        time::pause();

        let rpc = Arc::new(TrackingMockRpc::new());
        let delivery_node = content_delivery_node(rpc.clone());

        delivery_node.broadcast(Arc::new(test_message(10)), None).unwrap();
        delivery_node.broadcast(Arc::new(test_message_with_previous(20, 10)), None).unwrap();
        delivery_node.add_neighbor(node(2));
        sleep(Duration::from_millis(10)).await;

        assert_eq!(rpc.stream_messages_to(node(2)).await, 2);
    }

    #[tokio::test]
    async fn test_leave_notice_removes_neighbor() {
        time::pause();

        let rpc = Arc::new(TrackingMockRpc::new());
        let delivery_node = content_delivery_node(rpc.clone());
        delivery_node.add_neighbor(node(2));
        delivery_node.add_neighbor(node(3));

        delivery_node.rpc_local().on_leave_notice(&test_stream_part_id(), &node(2));
        assert_eq!(delivery_node.get_neighbors(), vec![node(3)]);

        delivery_node.broadcast(Arc::new(test_message(10)), None).unwrap();
        sleep(Duration::from_millis(10)).await;
        assert_eq!(rpc.stream_messages_to(node(2)).await, 0);
    }

    #[tokio::test]
    async fn test_send_to_removed_neighbor_fails() {
        let rpc = Arc::new(TrackingMockRpc::new());
        let neighbors = Arc::new(Mutex::new(NeighborList::new(node(1), 10)));
        neighbors.lock().unwrap().add(node(2));
        let sender = NeighborRpcSender { rpc: rpc.clone(), neighbors: neighbors.clone() };

        assert!(sender.send_to_neighbor(&node(2), &test_message(1)).await.is_ok());
        neighbors.lock().unwrap().remove(&node(2));
        assert!(sender.send_to_neighbor(&node(2), &test_message(2)).await.is_err());

        assert_eq!(rpc.stream_messages_to(node(2)).await, 1);
    }

    #[tokio::test]
    async fn test_stop_sends_leave_notices() {
        let rpc = Arc::new(TrackingMockRpc::new());
        let delivery_node = content_delivery_node(rpc.clone());
        delivery_node.add_neighbor(node(2));
        delivery_node.add_neighbor(node(3));

        delivery_node.stop().await;

        assert_eq!(rpc.leave_notices().await, vec![node(2), node(3)]);
        assert!(delivery_node.get_neighbors().is_empty());
    }
}
