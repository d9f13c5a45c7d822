pub mod node_id;
pub mod rpc;
pub mod stream_message;
