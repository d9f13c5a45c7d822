use std::fmt::{Debug, Display, Formatter};
use std::hash::Hash;


/// Everything that can identify a node for the delivery layer. The overlay's routing layer
///  decides what a node id actually is; delivery only needs to compare, hash, log and pass them
///  around between tasks.
pub trait NodeIdentity: Clone + Eq + Hash + Debug + Send + Sync + 'static {}
impl<T: Clone + Eq + Hash + Debug + Send + Sync + 'static> NodeIdentity for T {}

/// A node's address in the overlay's 160 bit key space, as assigned by the routing layer.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodeId(pub [u8; 20]);

impl Debug for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self)
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl NodeId {
    #[cfg(test)]
    pub fn from_number(number: u16) -> NodeId {
        let mut raw = [0u8; 20];
        raw[18..].copy_from_slice(&number.to_be_bytes());
        NodeId(raw)
    }
}

/// The identity of the user on whose behalf a proxy connection is requested, e.g. an Ethereum
///  address in hex representation.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct UserId(pub String);

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
