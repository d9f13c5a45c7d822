use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, trace, warn};

use crate::delivery::content_delivery_node::ContentDeliveryNode;
use crate::delivery::content_delivery_rpc_local::StreamPartDelivery;
use crate::delivery::delivery_config::DeliveryConfig;
use crate::delivery::delivery_error::DeliveryError;
use crate::messaging::node_id::{NodeIdentity, UserId};
use crate::messaging::rpc::{ConnectionLocker, ContentDeliveryRpc, DisconnectEvents, ProxyConnectionRpc, ProxyDirection};
use crate::messaging::stream_message::{StreamMessage, StreamPartId};
use crate::proxy::proxy_client::ProxyClient;
use crate::util::random::RngRandom;


type ProxyClientFor<N, R, L> = ProxyClient<N, ProxyDirection, R, L, RngRandom>;

enum StreamPart<N: NodeIdentity, R: ContentDeliveryRpc<N> + ProxyConnectionRpc<N, ProxyDirection>, L: ConnectionLocker<N>> {
    Graph(Arc<ContentDeliveryNode<N, R>>),
    Proxied(Arc<ProxyClientFor<N, R, L>>),
}

impl<N, R, L> Clone for StreamPart<N, R, L>
where
    N: NodeIdentity,
    R: ContentDeliveryRpc<N> + ProxyConnectionRpc<N, ProxyDirection>,
    L: ConnectionLocker<N>,
{
    fn clone(&self) -> Self {
        match self {
            StreamPart::Graph(node) => StreamPart::Graph(node.clone()),
            StreamPart::Proxied(client) => StreamPart::Proxied(client.clone()),
        }
    }
}

/// The delivery layer's public API: a node's registry of the stream partitions it takes part in,
///  either as a member of the stream partition's overlay or through proxy connections.
///
/// Messages delivered in any of the stream partitions are emitted on a single channel, see
///  [DeliveryManager::subscribe].
pub struct DeliveryManager<N: NodeIdentity, R: ContentDeliveryRpc<N> + ProxyConnectionRpc<N, ProxyDirection>, L: ConnectionLocker<N>> {
    config: Arc<DeliveryConfig>,
    local_node: N,
    rpc: Arc<R>,
    locker: Arc<L>,
    /// never read, only resubscribed for each new proxy client
    disconnects: DisconnectEvents<N>,
    stream_parts: Mutex<FxHashMap<StreamPartId, StreamPart<N, R, L>>>,
    messages: broadcast::Sender<Arc<StreamMessage>>,
}

impl<N, R, L> DeliveryManager<N, R, L>
where
    N: NodeIdentity,
    R: ContentDeliveryRpc<N> + ProxyConnectionRpc<N, ProxyDirection>,
    L: ConnectionLocker<N>,
{
    pub fn new(config: Arc<DeliveryConfig>, local_node: N, rpc: Arc<R>, locker: Arc<L>, disconnects: DisconnectEvents<N>) -> DeliveryManager<N, R, L> {
        let (messages, _) = broadcast::channel(config.message_channel_capacity);
        DeliveryManager {
            config,
            local_node,
            rpc,
            locker,
            disconnects,
            stream_parts: Default::default(),
            messages,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<StreamMessage>> {
        self.messages.subscribe()
    }

    pub fn get_stream_parts(&self) -> Vec<StreamPartId> {
        self.stream_parts.lock().unwrap()
            .keys()
            .cloned()
            .collect()
    }

    /// Joins a stream partition's overlay. This is a no-op if the stream partition is already
    ///  joined, either way.
    pub fn join_stream_part(&self, stream_part_id: StreamPartId) {
        let mut stream_parts = self.stream_parts.lock().unwrap();
        if stream_parts.contains_key(&stream_part_id) {
            return;
        }

        info!(stream_part = %stream_part_id, "joining stream partition");
        let node = Arc::new(ContentDeliveryNode::new(&self.config, stream_part_id.clone(), self.local_node.clone(), self.rpc.clone()));
        self.forward_messages(node.subscribe());
        stream_parts.insert(stream_part_id, StreamPart::Graph(node));
    }

    pub fn add_neighbor(&self, stream_part_id: &StreamPartId, node: N) {
        match self.get_stream_part(stream_part_id) {
            Some(StreamPart::Graph(delivery_node)) => delivery_node.add_neighbor(node),
            _ => debug!(stream_part = %stream_part_id, ?node, "ignoring neighbor for a stream partition without overlay"),
        }
    }

    pub fn remove_neighbor(&self, stream_part_id: &StreamPartId, node: &N) {
        if let Some(StreamPart::Graph(delivery_node)) = self.get_stream_part(stream_part_id) {
            delivery_node.remove_neighbor(node);
        }
    }

    /// Publishes a locally created message, joining its stream partition if necessary
    pub fn broadcast(&self, message: StreamMessage) -> Result<(), DeliveryError> {
        let stream_part_id = message.message_id.stream_part_id.clone();
        self.join_stream_part(stream_part_id.clone());

        match self.get_stream_part(&stream_part_id) {
            Some(StreamPart::Graph(node)) => node.broadcast(Arc::new(message), None),
            Some(StreamPart::Proxied(client)) => client.broadcast(Arc::new(message), None),
            None => Ok(()),
        }
    }

    /// inbound 'deliver message' call, routed to the message's stream partition
    pub fn on_stream_message(&self, message: StreamMessage, sender: N) -> Result<(), DeliveryError> {
        match self.get_stream_part(&message.message_id.stream_part_id) {
            Some(StreamPart::Graph(node)) => node.rpc_local().on_stream_message(message, sender),
            Some(StreamPart::Proxied(client)) => client.rpc_local().on_stream_message(message, sender),
            None => {
                trace!(stream_part = %message.message_id.stream_part_id, ?sender, "ignoring message for a stream partition that was not joined");
                Ok(())
            }
        }
    }

    /// inbound 'leave notice' call
    pub fn on_leave_notice(&self, stream_part_id: &StreamPartId, sender: &N) {
        match self.get_stream_part(stream_part_id) {
            Some(StreamPart::Graph(node)) => node.rpc_local().on_leave_notice(stream_part_id, sender),
            Some(StreamPart::Proxied(client)) => client.rpc_local().on_leave_notice(stream_part_id, sender),
            None => {}
        }
    }

    /// Receives or publishes a stream partition's messages through proxy connections instead of
    ///  the overlay. An empty node list or a connection count of 0 ends proxied delivery for the
    ///  stream partition.
    pub async fn set_proxies(&self, stream_part_id: StreamPartId, nodes: Vec<N>, direction: ProxyDirection, user_id: UserId, connection_count: Option<usize>) -> Result<(), DeliveryError> {
        if self.config.accept_proxy_connections {
            return Err(DeliveryError::ProxyConnectionsNotAllowed);
        }

        let enable = !nodes.is_empty() && connection_count != Some(0);
        if enable {
            let client = self.get_or_create_proxy_client(&stream_part_id).await;
            client.set_proxies(nodes, direction, user_id, connection_count).await
        }
        else {
            let removed = {
                let mut stream_parts = self.stream_parts.lock().unwrap();
                if matches!(stream_parts.get(&stream_part_id), Some(StreamPart::Proxied(_))) {
                    stream_parts.remove(&stream_part_id)
                }
                else {
                    None
                }
            };
            if let Some(StreamPart::Proxied(client)) = removed {
                info!(stream_part = %stream_part_id, "ending proxied delivery");
                client.stop().await;
            }
            Ok(())
        }
    }

    /// `direction` `None` means 'either direction'
    pub fn is_proxied_stream_part(&self, stream_part_id: &StreamPartId, direction: Option<ProxyDirection>) -> bool {
        match self.get_stream_part(stream_part_id) {
            Some(StreamPart::Proxied(client)) => match direction {
                Some(direction) => client.get_direction() == Some(direction),
                None => true,
            },
            _ => false,
        }
    }

    pub async fn leave_stream_part(&self, stream_part_id: &StreamPartId) {
        let removed = self.stream_parts.lock().unwrap().remove(stream_part_id);
        if let Some(stream_part) = removed {
            info!(stream_part = %stream_part_id, "leaving stream partition");
            Self::stop_stream_part(stream_part).await;
        }
    }

    pub async fn stop(&self) {
        let stream_parts = self.stream_parts.lock().unwrap()
            .drain()
            .map(|(_, stream_part)| stream_part)
            .collect::<Vec<_>>();

        for stream_part in stream_parts {
            Self::stop_stream_part(stream_part).await;
        }
    }

    async fn stop_stream_part(stream_part: StreamPart<N, R, L>) {
        match stream_part {
            StreamPart::Graph(node) => node.stop().await,
            StreamPart::Proxied(client) => client.stop().await,
        }
    }

    fn get_stream_part(&self, stream_part_id: &StreamPartId) -> Option<StreamPart<N, R, L>> {
        self.stream_parts.lock().unwrap()
            .get(stream_part_id)
            .cloned()
    }

    /// replaces the stream partition's overlay membership (if any) with a new proxy client
    async fn get_or_create_proxy_client(&self, stream_part_id: &StreamPartId) -> Arc<ProxyClientFor<N, R, L>> {
        let (client, replaced) = {
            let mut stream_parts = self.stream_parts.lock().unwrap();
            match stream_parts.get(stream_part_id) {
                Some(StreamPart::Proxied(client)) => (client.clone(), None),
                _ => {
                    debug!(stream_part = %stream_part_id, "creating proxy client");
                    let client = Arc::new(ProxyClient::new(self.config.clone(), stream_part_id.clone(), self.rpc.clone(), self.locker.clone()));
                    client.start(self.disconnects.resubscribe());
                    self.forward_messages(client.subscribe());
                    let replaced = stream_parts.insert(stream_part_id.clone(), StreamPart::Proxied(client.clone()));
                    (client, replaced)
                }
            }
        };

        if let Some(replaced) = replaced {
            Self::stop_stream_part(replaced).await;
        }
        client
    }

    fn forward_messages(&self, mut stream_part_messages: broadcast::Receiver<Arc<StreamMessage>>) {
        let messages = self.messages.clone();
        tokio::spawn(async move {
            loop {
                match stream_part_messages.recv().await {
                    Ok(message) => {
                        let _ = messages.send(message);
                    }
                    Err(RecvError::Lagged(num_skipped)) => warn!("delivered messages were not forwarded fast enough, skipped {}", num_skipped),
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }
}
