use bytes::Bytes;

use crate::messaging::stream_message::{MessageId, MessageRef, StreamMessage, StreamPartId};


pub const TEST_STREAM_ID: &str = "test-stream";

pub fn test_stream_part_id() -> StreamPartId {
    StreamPartId::new(TEST_STREAM_ID, 0)
}

/// convenience for unit tests: a message in a fixed chain of a fixed stream partition, without a
///  previous message reference, identified by its timestamp
pub fn test_message(timestamp: i64) -> StreamMessage {
    test_message_in_chain(test_stream_part_id(), "publisher", timestamp, None)
}

pub fn test_message_with_previous(timestamp: i64, previous_timestamp: i64) -> StreamMessage {
    test_message_in_chain(test_stream_part_id(), "publisher", timestamp, Some(MessageRef::new(previous_timestamp, 0)))
}

pub fn test_message_in_chain(stream_part_id: StreamPartId, publisher_id: &str, timestamp: i64, previous_message_ref: Option<MessageRef>) -> StreamMessage {
    StreamMessage {
        message_id: MessageId {
            stream_part_id,
            publisher_id: publisher_id.to_string(),
            message_chain_id: "chain".to_string(),
            message_ref: MessageRef::new(timestamp, 0),
        },
        previous_message_ref,
        content: Bytes::from(format!("content {}", timestamp)),
    }
}
