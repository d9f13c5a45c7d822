use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashSet;
use tracing::trace;

use crate::messaging::node_id::NodeIdentity;
use crate::messaging::stream_message::{MessageId, StreamMessage};
use crate::util::fifo_ttl_cache::FifoTtlCache;


#[derive(Debug)]
pub struct PropagationTask<N: NodeIdentity> {
    pub message: Arc<StreamMessage>,
    /// the neighbor the message was received from, if any - it is never sent back there
    pub source: Option<N>,
    /// neighbors the message was successfully sent to
    pub handled_neighbors: FxHashSet<N>,
}

impl<N: NodeIdentity> PropagationTask<N> {
    pub fn new(message: Arc<StreamMessage>, source: Option<N>) -> PropagationTask<N> {
        PropagationTask {
            message,
            source,
            handled_neighbors: Default::default(),
        }
    }

    /// whether the message still needs to be sent to a given neighbor
    pub fn is_pending_for(&self, neighbor: &N) -> bool {
        self.source.as_ref() != Some(neighbor) && !self.handled_neighbors.contains(neighbor)
    }
}

/// In-flight propagation tasks. Tasks expire after a fixed time, and the store's capacity is
///  bounded, evicting the oldest tasks first.
#[derive(Debug)]
pub struct PropagationTaskStore<N: NodeIdentity> {
    tasks: FifoTtlCache<MessageId, PropagationTask<N>>,
}

impl<N: NodeIdentity> PropagationTaskStore<N> {
    pub fn new(ttl: Duration, max_tasks: usize) -> PropagationTaskStore<N> {
        PropagationTaskStore {
            tasks: FifoTtlCache::with_drop_callback(ttl, max_tasks, |message_id: &MessageId| {
                trace!(message = %message_id.message_ref, publisher = %message_id.publisher_id, "propagation task removed");
            }),
        }
    }

    pub fn add(&mut self, task: PropagationTask<N>) {
        self.tasks.set(task.message.message_id.clone(), task);
    }

    pub fn get_mut(&mut self, message_id: &MessageId) -> Option<&mut PropagationTask<N>> {
        self.tasks.get_mut(message_id)
    }

    pub fn delete(&mut self, message_id: &MessageId) {
        self.tasks.delete(message_id);
    }

    /// all live tasks, oldest first
    pub fn get(&mut self) -> Vec<&PropagationTask<N>> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
