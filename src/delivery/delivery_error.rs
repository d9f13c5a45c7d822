use thiserror::Error;

use crate::messaging::stream_message::MessageRef;


#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum DeliveryError {
    /// a message claims a predecessor that is not before the message itself
    #[error("invalid numbering: previous message {previous} is not before {current}")]
    InvalidOrdering {
        previous: MessageRef,
        current: MessageRef,
    },

    /// the claimed chain link crosses a tracked gap's boundary, which points to a misbehaving peer
    #[error("message {previous} -> {current} does not fit the known gaps: {gaps}")]
    GapMismatch {
        gaps: String,
        previous: MessageRef,
        current: MessageRef,
    },

    #[error("cannot open {requested} proxy connections to only {available} nodes")]
    ConnectionCountViolation {
        requested: usize,
        available: usize,
    },

    #[error("cannot set proxies on a node that accepts proxy connections")]
    ProxyConnectionsNotAllowed,
}
