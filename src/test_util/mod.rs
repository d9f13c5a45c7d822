//! Utilities for unit tests of delivery functionality: deterministic test messages, and a mock of
//!  the RPC layer that tracks all outgoing calls.

pub mod message;
pub mod rpc;
