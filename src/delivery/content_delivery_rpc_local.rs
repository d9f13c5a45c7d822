use std::marker::PhantomData;
use std::sync::Arc;

use tracing::trace;

use crate::delivery::delivery_error::DeliveryError;
use crate::messaging::node_id::NodeIdentity;
use crate::messaging::stream_message::{StreamMessage, StreamPartId};


/// Delivery of one stream partition's messages, either through the organic overlay or through
///  proxy connections.
pub trait StreamPartDelivery<N: NodeIdentity>: Send + Sync + 'static {
    fn stream_part_id(&self) -> &StreamPartId;

    /// returns whether the message is new, marking it as seen
    fn mark_and_check(&self, message: &StreamMessage) -> Result<bool, DeliveryError>;

    /// Emits a message locally and propagates it. `previous_node` is the node the message was
    ///  received from (if any); the message is not sent back there, and it is assumed to be
    ///  duplicate checked already.
    fn broadcast(&self, message: Arc<StreamMessage>, previous_node: Option<N>) -> Result<(), DeliveryError>;

    /// a node announced that it stops participating in this stream partition
    fn on_leave_notice(self: &Arc<Self>, sender: &N);
}

/// The handlers for inbound RPC calls of one stream partition's delivery service
pub struct ContentDeliveryRpcLocal<N: NodeIdentity, D: StreamPartDelivery<N>> {
    delivery: Arc<D>,
    pd: PhantomData<N>,
}

impl<N: NodeIdentity, D: StreamPartDelivery<N>> ContentDeliveryRpcLocal<N, D> {
    pub fn new(delivery: Arc<D>) -> ContentDeliveryRpcLocal<N, D> {
        ContentDeliveryRpcLocal {
            delivery,
            pd: PhantomData::default(),
        }
    }

    /// the address the handlers are registered under
    pub fn service_id(&self) -> String {
        self.delivery.stream_part_id().delivery_service_id()
    }

    pub fn on_stream_message(&self, message: StreamMessage, sender: N) -> Result<(), DeliveryError> {
        if self.delivery.mark_and_check(&message)? {
            self.delivery.broadcast(Arc::new(message), Some(sender))
        }
        else {
            trace!(?sender, message = %message.message_id.message_ref, "ignoring duplicate message");
            Ok(())
        }
    }

    pub fn on_leave_notice(&self, stream_part_id: &StreamPartId, sender: &N) {
        if stream_part_id == self.delivery.stream_part_id() {
            self.delivery.on_leave_notice(sender);
        }
        else {
            trace!(?sender, %stream_part_id, "ignoring leave notice for a different stream partition");
        }
    }
}
