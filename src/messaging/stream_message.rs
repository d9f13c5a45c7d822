use std::fmt::{Debug, Display, Formatter};

use bytes::Bytes;


/// A message's position in its chain: ordered by timestamp first, sequence number second (which
///  is the derived lexicographic order of the fields).
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MessageRef {
    pub timestamp: i64,
    pub sequence_number: u32,
}
impl MessageRef {
    pub const fn new(timestamp: i64, sequence_number: u32) -> MessageRef {
        MessageRef {
            timestamp,
            sequence_number,
        }
    }
}

impl Debug for MessageRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl Display for MessageRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}", self.timestamp, self.sequence_number)
    }
}

/// A stream is split into partitions, and delivery happens per partition - each has its own
///  overlay and its own set of proxy connections.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct StreamPartId {
    pub stream_id: String,
    pub partition: u32,
}
impl StreamPartId {
    pub fn new(stream_id: impl Into<String>, partition: u32) -> StreamPartId {
        StreamPartId {
            stream_id: stream_id.into(),
            partition,
        }
    }

    /// the address under which a stream partition's delivery RPC handlers are registered
    pub fn delivery_service_id(&self) -> String {
        format!("stream-part-delivery-{}", self)
    }
}

impl Display for StreamPartId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.stream_id, self.partition)
    }
}

/// Identifies one ordered chain of messages: a publisher can publish several independent chains
///  (e.g. from different sessions) to the same stream partition.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct SequenceKey {
    pub publisher_id: String,
    pub message_chain_id: String,
}

#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct MessageId {
    pub stream_part_id: StreamPartId,
    pub publisher_id: String,
    pub message_chain_id: String,
    pub message_ref: MessageRef,
}
impl MessageId {
    pub fn sequence_key(&self) -> SequenceKey {
        SequenceKey {
            publisher_id: self.publisher_id.clone(),
            message_chain_id: self.message_chain_id.clone(),
        }
    }
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct StreamMessage {
    pub message_id: MessageId,
    /// the message the publisher sent before this one in the same chain, if it chose to say
    pub previous_message_ref: Option<MessageRef>,
    pub content: Bytes,
}
