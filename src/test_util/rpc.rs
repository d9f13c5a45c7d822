use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use anyhow::anyhow;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::RwLock;
use tokio::time::sleep;

use crate::messaging::node_id::{NodeId, UserId};
use crate::messaging::rpc::{ConnectionLocker, ContentDeliveryRpc, NeighborSender, ProxyConnectionRpc, ProxyDirection};
use crate::messaging::stream_message::{MessageRef, StreamMessage, StreamPartId};


#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TrackedCall {
    StreamMessage { to: NodeId, message_ref: MessageRef },
    LeaveNotice { to: NodeId, stream_part_id: StreamPartId },
    ConnectionRequest { to: NodeId, direction: ProxyDirection, user_id: UserId },
}

/// Records every outgoing call, in order. By default, all sends succeed and all connection requests
///  are accepted; failures, rejections and unresponsive peers can be configured per node.
#[derive(Debug, Default)]
pub struct TrackingMockRpc {
    tracker: RwLock<Vec<TrackedCall>>,
    failing_nodes: RwLock<FxHashSet<NodeId>>,
    rejecting_nodes: RwLock<FxHashSet<NodeId>>,
    unresponsive_nodes: RwLock<FxHashSet<NodeId>>,
}

impl TrackingMockRpc {
    pub fn new() -> TrackingMockRpc {
        Default::default()
    }

    pub async fn fail_sends_to(&self, node: NodeId) {
        self.failing_nodes.write().await.insert(node);
    }

    pub async fn reject_connections_from(&self, node: NodeId) {
        self.rejecting_nodes.write().await.insert(node);
    }

    pub async fn accept_connections_from(&self, node: NodeId) {
        self.rejecting_nodes.write().await.remove(&node);
        self.unresponsive_nodes.write().await.remove(&node);
    }

    /// connection requests to this node never get a response
    pub async fn ignore_connection_requests_from(&self, node: NodeId) {
        self.unresponsive_nodes.write().await.insert(node);
    }

    pub async fn calls(&self) -> Vec<TrackedCall> {
        self.tracker.read().await.clone()
    }

    pub async fn clear(&self) {
        self.tracker.write().await.clear();
    }

    pub async fn stream_messages(&self) -> Vec<(NodeId, MessageRef)> {
        self.tracker.read().await.iter()
            .filter_map(|c| match c {
                TrackedCall::StreamMessage { to, message_ref } => Some((*to, *message_ref)),
                _ => None,
            })
            .collect()
    }

    pub async fn stream_messages_to(&self, node: NodeId) -> usize {
        self.stream_messages().await.iter()
            .filter(|(to, _)| *to == node)
            .count()
    }

    pub async fn leave_notices(&self) -> Vec<NodeId> {
        self.tracker.read().await.iter()
            .filter_map(|c| match c {
                TrackedCall::LeaveNotice { to, .. } => Some(*to),
                _ => None,
            })
            .collect()
    }

    pub async fn connection_requests(&self) -> Vec<NodeId> {
        self.tracker.read().await.iter()
            .filter_map(|c| match c {
                TrackedCall::ConnectionRequest { to, .. } => Some(*to),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl ContentDeliveryRpc<NodeId> for TrackingMockRpc {
    async fn send_stream_message(&self, to: &NodeId, message: &StreamMessage) -> anyhow::Result<()> {
        self.tracker.write().await.push(TrackedCall::StreamMessage {
            to: *to,
            message_ref: message.message_id.message_ref,
        });

        if self.failing_nodes.read().await.contains(to) {
            return Err(anyhow!("simulated send failure"));
        }
        Ok(())
    }

    async fn leave_stream_part_notice(&self, to: &NodeId, stream_part_id: &StreamPartId) {
        self.tracker.write().await.push(TrackedCall::LeaveNotice {
            to: *to,
            stream_part_id: stream_part_id.clone(),
        });
    }
}

#[async_trait]
impl NeighborSender<NodeId> for TrackingMockRpc {
    async fn send_to_neighbor(&self, neighbor: &NodeId, message: &StreamMessage) -> anyhow::Result<()> {
        self.send_stream_message(neighbor, message).await
    }
}

#[async_trait]
impl ProxyConnectionRpc<NodeId, ProxyDirection> for TrackingMockRpc {
    async fn request_connection(&self, to: &NodeId, direction: ProxyDirection, user_id: &UserId) -> anyhow::Result<bool> {
        self.tracker.write().await.push(TrackedCall::ConnectionRequest {
            to: *to,
            direction,
            user_id: user_id.clone(),
        });

        if self.unresponsive_nodes.read().await.contains(to) {
            sleep(Duration::from_secs(3600)).await;
        }
        if self.failing_nodes.read().await.contains(to) {
            return Err(anyhow!("simulated connection failure"));
        }
        Ok(!self.rejecting_nodes.read().await.contains(to))
    }
}

/// Counts the locks held per node
#[derive(Debug, Default)]
pub struct TrackingConnectionLocker {
    locks: Mutex<FxHashMap<NodeId, i64>>,
}

impl TrackingConnectionLocker {
    pub fn new() -> TrackingConnectionLocker {
        Default::default()
    }

    pub fn lock_count(&self, node: NodeId) -> i64 {
        self.locks.lock().unwrap()
            .get(&node)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_lock_count(&self) -> i64 {
        self.locks.lock().unwrap()
            .values()
            .sum()
    }
}

impl ConnectionLocker<NodeId> for TrackingConnectionLocker {
    fn lock_connection(&self, node: &NodeId, tag: &str) {
        assert_eq!(tag, crate::proxy::proxy_client::PROXY_CONNECTION_LOCK_TAG);
        *self.locks.lock().unwrap().entry(*node).or_default() += 1;
    }

    fn unlock_connection(&self, node: &NodeId, tag: &str) {
        assert_eq!(tag, crate::proxy::proxy_client::PROXY_CONNECTION_LOCK_TAG);
        let mut locks = self.locks.lock().unwrap();
        let count = locks.entry(*node).or_default();
        *count -= 1;
        assert!(*count >= 0, "unlocked {:?} more often than it was locked", node);
    }
}
