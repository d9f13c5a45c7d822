use crate::messaging::node_id::NodeIdentity;


/// The neighbors of a node in one stream partition's overlay, in the order they were added.
///
/// The list never contains the local node, and it is bounded: adding a neighbor to a full list is
///  a no-op.
#[derive(Debug)]
pub struct NeighborList<N: NodeIdentity> {
    local_node: N,
    max_size: usize,
    neighbors: Vec<N>,
}

impl<N: NodeIdentity> NeighborList<N> {
    pub fn new(local_node: N, max_size: usize) -> NeighborList<N> {
        NeighborList {
            local_node,
            max_size,
            neighbors: Vec::new(),
        }
    }

    /// returns whether the neighbor was added
    pub fn add(&mut self, node: N) -> bool {
        if node == self.local_node || self.neighbors.len() >= self.max_size || self.contains(&node) {
            return false;
        }
        self.neighbors.push(node);
        true
    }

    /// returns whether the node was a neighbor
    pub fn remove(&mut self, node: &N) -> bool {
        let len_before = self.neighbors.len();
        self.neighbors.retain(|n| n != node);
        self.neighbors.len() != len_before
    }

    pub fn contains(&self, node: &N) -> bool {
        self.neighbors.contains(node)
    }

    pub fn ids(&self) -> Vec<N> {
        self.neighbors.clone()
    }

    pub fn len(&self) -> usize {
        self.neighbors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.neighbors.is_empty()
    }

    pub fn clear(&mut self) {
        self.neighbors.clear();
    }
}
