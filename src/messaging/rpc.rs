//! The seams to the layers below delivery: the RPC layer that delivers messages and notices to a
//!  peer, and the transport that keeps connections alive and reports disconnects.
//!
//! Serialization, connection establishment and routing are all on the other side of these
//!  traits.

use std::fmt::Debug;
use std::hash::Hash;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::sync::broadcast;

use crate::messaging::node_id::{NodeIdentity, UserId};
use crate::messaging::stream_message::{StreamMessage, StreamPartId};


/// The direction of a proxy connection, seen from the node that requests it
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum ProxyDirection {
    /// the requesting node publishes messages through the proxy
    Publish,
    /// the requesting node receives a stream partition's messages through the proxy
    Subscribe,
}

pub trait ConnectionDirection: Copy + Eq + Hash + Debug + Send + Sync + 'static {}
impl<T: Copy + Eq + Hash + Debug + Send + Sync + 'static> ConnectionDirection for T {}

/// Remote calls of a stream partition's content delivery service on another node
#[async_trait]
pub trait ContentDeliveryRpc<N: NodeIdentity>: Send + Sync + 'static {
    async fn send_stream_message(&self, to: &N, message: &StreamMessage) -> anyhow::Result<()>;

    /// This is a notification, i.e. there is no response and no guarantee of delivery
    async fn leave_stream_part_notice(&self, to: &N, stream_part_id: &StreamPartId);
}

#[async_trait]
pub trait ProxyConnectionRpc<N: NodeIdentity, D: ConnectionDirection>: Send + Sync + 'static {
    /// returns whether the remote node accepted the connection
    async fn request_connection(&self, to: &N, direction: D, user_id: &UserId) -> anyhow::Result<bool>;
}

/// Per-neighbor unicast delivery as seen by propagation: implementations decide which nodes are
///  currently valid targets.
#[async_trait]
pub trait NeighborSender<N: NodeIdentity>: Send + Sync + 'static {
    async fn send_to_neighbor(&self, neighbor: &N, message: &StreamMessage) -> anyhow::Result<()>;
}

/// Reference counted keep-alive for transport level connections: a connection is not torn down
///  while it is locked. Every lock must be paired with an unlock for the same tag.
#[cfg_attr(test, automock)]
pub trait ConnectionLocker<N: NodeIdentity>: Send + Sync + 'static {
    fn lock_connection(&self, node: &N, tag: &str);
    fn unlock_connection(&self, node: &N, tag: &str);
}

/// The transport's notifications of peers that disconnected
pub type DisconnectEvents<N> = broadcast::Receiver<N>;
