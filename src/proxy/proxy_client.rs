use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use async_trait::async_trait;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::select;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::delivery::content_delivery_rpc_local::{ContentDeliveryRpcLocal, StreamPartDelivery};
use crate::delivery::delivery_config::DeliveryConfig;
use crate::delivery::delivery_error::DeliveryError;
use crate::delivery::duplicate_detector::DuplicateDetectors;
use crate::delivery::propagation::Propagation;
use crate::messaging::node_id::{NodeIdentity, UserId};
use crate::messaging::rpc::{ConnectionDirection, ConnectionLocker, ContentDeliveryRpc, DisconnectEvents, NeighborSender, ProxyConnectionRpc};
use crate::messaging::stream_message::{StreamMessage, StreamPartId};
use crate::proxy::retry::retry_until_success;
use crate::util::random::{sample, Random, RngRandom};


/// the tag under which proxy connections are locked in the transport
pub const PROXY_CONNECTION_LOCK_TAG: &str = "system/proxy-client";

#[derive(Debug)]
struct ProxyDefinition<N, D> {
    nodes: Vec<N>,
    connection_count: usize,
    direction: D,
    user_id: UserId,
}

#[derive(Debug)]
struct ProxyState<N: NodeIdentity, D> {
    definition: Option<ProxyDefinition<N, D>>,
    connections: FxHashMap<N, D>,
}

/// What a single reconciliation pass does, computed atomically from the current state
struct ReconciliationPlan<N, D> {
    close: Vec<N>,
    open: Vec<N>,
    direction: D,
    user_id: UserId,
    connection_count: usize,
}

/// Propagation over proxy connections: only nodes with an open proxy connection are valid targets
pub struct ProxyNeighborSender<N: NodeIdentity, D, R> {
    rpc: Arc<R>,
    state: Arc<Mutex<ProxyState<N, D>>>,
}

#[async_trait]
impl<N: NodeIdentity, D: ConnectionDirection, R: ContentDeliveryRpc<N>> NeighborSender<N> for ProxyNeighborSender<N, D, R> {
    async fn send_to_neighbor(&self, neighbor: &N, message: &StreamMessage) -> anyhow::Result<()> {
        let is_connected = self.state.lock().unwrap().connections.contains_key(neighbor);
        if !is_connected {
            return Err(anyhow!("propagation target not found"));
        }
        self.rpc.send_stream_message(neighbor, message).await
    }
}

/// Maintains explicit outbound connections to a chosen subset of designated proxy nodes for one
///  stream partition, as an alternative to joining the stream partition's overlay.
///
/// The owning node defines the proxies wholesale through [ProxyClient::set_proxies], and the
///  client reconciles the open connections with that definition: connections to nodes that are no
///  longer candidates (or with the wrong direction) are closed, missing connections are opened to
///  randomly chosen candidates, and surplus connections are closed at random.
///
/// When a proxy disconnects, the client keeps trying to restore the connection count on a fixed
///  interval until it succeeds or the client is stopped.
pub struct ProxyClient<N: NodeIdentity, D: ConnectionDirection, R: ContentDeliveryRpc<N>, L, RND: Random> {
    config: Arc<DeliveryConfig>,
    stream_part_id: StreamPartId,
    rpc: Arc<R>,
    locker: Arc<L>,
    state: Arc<Mutex<ProxyState<N, D>>>,
    duplicate_detectors: Mutex<DuplicateDetectors>,
    propagation: Propagation<N, ProxyNeighborSender<N, D, R>>,
    messages: broadcast::Sender<Arc<StreamMessage>>,
    /// reconciliation passes are serialized
    reconcile_lock: tokio::sync::Mutex<()>,
    cancel: broadcast::Sender<()>,
    pd: PhantomData<RND>,
}

impl<N, D, R, L> ProxyClient<N, D, R, L, RngRandom>
where
    N: NodeIdentity,
    D: ConnectionDirection,
    R: ContentDeliveryRpc<N> + ProxyConnectionRpc<N, D>,
    L: ConnectionLocker<N>,
{
    pub fn new(config: Arc<DeliveryConfig>, stream_part_id: StreamPartId, rpc: Arc<R>, locker: Arc<L>) -> ProxyClient<N, D, R, L, RngRandom> {
        Self::new_with_random(config, stream_part_id, rpc, locker)
    }
}

impl<N, D, R, L, RND> ProxyClient<N, D, R, L, RND>
where
    N: NodeIdentity,
    D: ConnectionDirection,
    R: ContentDeliveryRpc<N> + ProxyConnectionRpc<N, D>,
    L: ConnectionLocker<N>,
    RND: Random + 'static,
{
    pub fn new_with_random(config: Arc<DeliveryConfig>, stream_part_id: StreamPartId, rpc: Arc<R>, locker: Arc<L>) -> ProxyClient<N, D, R, L, RND> {
        let state = Arc::new(Mutex::new(ProxyState {
            definition: None,
            connections: Default::default(),
        }));
        let sender = Arc::new(ProxyNeighborSender {
            rpc: rpc.clone(),
            state: state.clone(),
        });

        let (messages, _) = broadcast::channel(config.message_channel_capacity);
        let (cancel, _) = broadcast::channel(1);

        ProxyClient {
            duplicate_detectors: Mutex::new(DuplicateDetectors::new(config.max_gap_count)),
            propagation: Propagation::new(&config, sender),
            config,
            stream_part_id,
            rpc,
            locker,
            state,
            messages,
            reconcile_lock: Default::default(),
            cancel,
            pd: PhantomData::default(),
        }
    }

    pub fn rpc_local(self: &Arc<Self>) -> ContentDeliveryRpcLocal<N, Self> {
        ContentDeliveryRpcLocal::new(self.clone())
    }

    /// all messages delivered in this stream partition, both local and remote
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<StreamMessage>> {
        self.messages.subscribe()
    }

    /// Replaces the proxy definition and reconciles connections with it. `connection_count`
    ///  defaults to the number of distinct candidate nodes.
    ///
    /// Connections that can not be opened are logged but do not cause an error: the slots stay
    ///  unfilled until the next reconciliation.
    pub async fn set_proxies(self: &Arc<Self>, nodes: Vec<N>, direction: D, user_id: UserId, connection_count: Option<usize>) -> Result<(), DeliveryError> {
        let mut distinct = FxHashSet::default();
        let nodes = nodes.into_iter()
            .filter(|n| distinct.insert(n.clone()))
            .collect::<Vec<_>>();

        let connection_count = connection_count.unwrap_or(nodes.len());
        if connection_count > nodes.len() {
            return Err(DeliveryError::ConnectionCountViolation {
                requested: connection_count,
                available: nodes.len(),
            });
        }

        debug!(stream_part = %self.stream_part_id, ?nodes, ?direction, connection_count, "setting proxies");
        self.state.lock().unwrap().definition = Some(ProxyDefinition {
            nodes,
            connection_count,
            direction,
            user_id,
        });

        if let Err(e) = self.update_connections().await {
            warn!(stream_part = %self.stream_part_id, "{}", e);
        }
        Ok(())
    }

    pub fn has_proxy_connection(&self, node: &N, direction: D) -> bool {
        self.state.lock().unwrap()
            .connections.get(node) == Some(&direction)
    }

    /// the direction of the current proxy definition, if any
    pub fn get_direction(&self) -> Option<D> {
        self.state.lock().unwrap()
            .definition.as_ref()
            .map(|d| d.direction)
    }

    pub fn get_connections(&self) -> Vec<N> {
        self.state.lock().unwrap()
            .connections.keys()
            .cloned()
            .collect()
    }

    /// Starts listening to the transport's disconnect notifications, until the client is stopped
    pub fn start(self: &Arc<Self>, mut disconnects: DisconnectEvents<N>) {
        let client = self.clone();
        let mut cancel = self.cancel.subscribe();

        tokio::spawn(async move {
            loop {
                select! {
                    evt = disconnects.recv() => {
                        match evt {
                            Ok(node) => client.on_node_disconnected(&node),
                            Err(RecvError::Lagged(num_skipped)) => warn!("proxy client fell behind on disconnect events, skipped {} events", num_skipped),
                            Err(RecvError::Closed) => break,
                        }
                    }
                    _ = cancel.recv() => break,
                }
            }
            trace!(stream_part = %client.stream_part_id, "stopped listening to disconnect events");
        });
    }

    /// Closes all proxy connections and cancels pending reconnects
    pub async fn stop(&self) {
        let _ = self.cancel.send(());

        let _reconciling = self.reconcile_lock.lock().await;
        let nodes = {
            let mut state = self.state.lock().unwrap();
            state.definition = None;
            state.connections.drain()
                .map(|(node, _)| node)
                .collect::<Vec<_>>()
        };

        for node in nodes {
            self.rpc.leave_stream_part_notice(&node, &self.stream_part_id).await;
            self.locker.unlock_connection(&node, PROXY_CONNECTION_LOCK_TAG);
            info!(?node, stream_part = %self.stream_part_id, "proxy connection closed");
        }
    }

    /// Returns an error if fewer connections than desired are open after the pass
    async fn update_connections(self: &Arc<Self>) -> anyhow::Result<()> {
        let _reconciling = self.reconcile_lock.lock().await;

        let plan = match self.reconciliation_plan() {
            Some(plan) => plan,
            None => return Ok(()),
        };

        for node in &plan.close {
            self.close_connection(node).await;
        }

        let mut attempts = JoinSet::new();
        for node in plan.open {
            let client = self.clone();
            let user_id = plan.user_id.clone();
            let direction = plan.direction;
            attempts.spawn(async move {
                client.attempt_connection(node, direction, &user_id).await
            });
        }
        while attempts.join_next().await.is_some() {}

        let num_connections = self.state.lock().unwrap().connections.len();
        if num_connections < plan.connection_count {
            return Err(anyhow!("only {} of {} proxy connections are open", num_connections, plan.connection_count));
        }
        Ok(())
    }

    fn reconciliation_plan(&self) -> Option<ReconciliationPlan<N, D>> {
        let state = self.state.lock().unwrap();
        let definition = state.definition.as_ref()?;

        let mut valid = Vec::new();
        let mut close = Vec::new();
        for (node, direction) in &state.connections {
            if *direction == definition.direction && definition.nodes.contains(node) {
                valid.push(node.clone());
            }
            else {
                close.push(node.clone());
            }
        }

        let mut open = Vec::new();
        if definition.connection_count > valid.len() {
            let unconnected = definition.nodes.iter()
                .filter(|n| !valid.contains(n))
                .cloned()
                .collect::<Vec<_>>();
            open = sample::<RND, _>(&unconnected, definition.connection_count - valid.len());
        }
        else {
            close.extend(sample::<RND, _>(&valid, valid.len() - definition.connection_count));
        }

        Some(ReconciliationPlan {
            close,
            open,
            direction: definition.direction,
            user_id: definition.user_id.clone(),
            connection_count: definition.connection_count,
        })
    }

    async fn attempt_connection(&self, node: N, direction: D, user_id: &UserId) {
        let accepted = match timeout(self.config.proxy_request_timeout, self.rpc.request_connection(&node, direction, user_id)).await {
            Ok(Ok(accepted)) => accepted,
            Ok(Err(e)) => {
                debug!(?node, "proxy connection request failed: {}", e);
                false
            }
            Err(_) => {
                debug!(?node, "proxy connection request timed out");
                false
            }
        };

        if accepted {
            self.locker.lock_connection(&node, PROXY_CONNECTION_LOCK_TAG);
            self.state.lock().unwrap().connections.insert(node.clone(), direction);
            self.propagation.on_neighbor_joined(&node);
            info!(?node, ?direction, stream_part = %self.stream_part_id, "proxy connection opened");
        }
        else {
            warn!(?node, ?direction, stream_part = %self.stream_part_id, "proxy connection rejected");
        }
    }

    async fn close_connection(&self, node: &N) {
        let was_connected = self.state.lock().unwrap().connections.remove(node).is_some();
        if was_connected {
            self.rpc.leave_stream_part_notice(node, &self.stream_part_id).await;
            self.locker.unlock_connection(node, PROXY_CONNECTION_LOCK_TAG);
            info!(?node, stream_part = %self.stream_part_id, "proxy connection closed");
        }
    }

    fn on_node_disconnected(self: &Arc<Self>, node: &N) {
        let was_connected = self.state.lock().unwrap().connections.remove(node).is_some();
        if !was_connected {
            return;
        }

        self.locker.unlock_connection(node, PROXY_CONNECTION_LOCK_TAG);
        info!(?node, stream_part = %self.stream_part_id, "proxy connection lost, reconnecting");

        let client = self.clone();
        let cancel = self.cancel.subscribe();
        tokio::spawn(async move {
            retry_until_success("restoring proxy connections", client.config.proxy_retry_interval, cancel, || client.update_connections()).await;
        });
    }
}

impl<N, D, R, L, RND> StreamPartDelivery<N> for ProxyClient<N, D, R, L, RND>
where
    N: NodeIdentity,
    D: ConnectionDirection,
    R: ContentDeliveryRpc<N> + ProxyConnectionRpc<N, D>,
    L: ConnectionLocker<N>,
    RND: Random + 'static,
{
    fn stream_part_id(&self) -> &StreamPartId {
        &self.stream_part_id
    }

    fn mark_and_check(&self, message: &StreamMessage) -> Result<bool, DeliveryError> {
        self.duplicate_detectors.lock().unwrap()
            .mark_and_check(&message.message_id, message.previous_message_ref)
    }

    fn broadcast(&self, message: Arc<StreamMessage>, previous_node: Option<N>) -> Result<(), DeliveryError> {
        if previous_node.is_none() {
            self.mark_and_check(&message)?;
        }

        // no subscribers is fine
        let _ = self.messages.send(message.clone());

        let targets = self.get_connections();
        self.propagation.feed_unseen_message(message, &targets, previous_node);
        Ok(())
    }

    fn on_leave_notice(self: &Arc<Self>, sender: &N) {
        self.on_node_disconnected(sender);
    }
}
