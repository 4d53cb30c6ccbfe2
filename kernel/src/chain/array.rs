//! Contiguous node storage
//!
//! A `NodeArray<T>` lays out fixed-size nodes back to back, each node being
//! a value plus its chain links. It is the usual backing store for chains:
//! control block tables, thread queue waiter records, watchdogs.

use alloc::vec::Vec;
use core::ops::{Index, IndexMut};

use super::{Links, NodeId, Nodes};

#[derive(Debug, Clone)]
struct Slot<T> {
    links: Links,
    value: T,
}

/// Contiguous storage of chain nodes carrying a `T` each
#[derive(Debug, Clone)]
pub struct NodeArray<T> {
    slots: Vec<Slot<T>>,
}

impl<T> NodeArray<T> {
    /// Create storage with no nodes
    pub const fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Create `count` nodes, the value of node `i` being `f(i)`
    ///
    /// All nodes start off chain.
    pub fn from_fn(count: usize, mut f: impl FnMut(usize) -> T) -> Self {
        let mut slots = Vec::with_capacity(count);
        for index in 0..count {
            slots.push(Slot {
                links: Links::OFF_CHAIN,
                value: f(index),
            });
        }
        Self { slots }
    }

    /// Add one off-chain node at the end of the storage
    pub fn push(&mut self, value: T) -> NodeId {
        let node = NodeId::new(self.slots.len());
        self.slots.push(Slot {
            links: Links::OFF_CHAIN,
            value,
        });
        node
    }

    /// Number of nodes in the storage
    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the storage has no nodes
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Value of `node`, if it exists
    #[inline]
    pub fn get(&self, node: NodeId) -> Option<&T> {
        self.slots.get(node.index()).map(|slot| &slot.value)
    }

    /// Mutable value of `node`, if it exists
    #[inline]
    pub fn get_mut(&mut self, node: NodeId) -> Option<&mut T> {
        self.slots.get_mut(node.index()).map(|slot| &mut slot.value)
    }

    /// Iterate over all nodes, on a chain or not
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &T)> {
        self.slots
            .iter()
            .enumerate()
            .map(|(index, slot)| (NodeId::new(index), &slot.value))
    }
}

impl<T> Default for NodeArray<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Nodes for NodeArray<T> {
    #[inline]
    fn links(&self, node: NodeId) -> &Links {
        &self.slots[node.index()].links
    }

    #[inline]
    fn links_mut(&mut self, node: NodeId) -> &mut Links {
        &mut self.slots[node.index()].links
    }
}

impl<T> Index<NodeId> for NodeArray<T> {
    type Output = T;

    #[inline]
    fn index(&self, node: NodeId) -> &T {
        &self.slots[node.index()].value
    }
}

impl<T> IndexMut<NodeId> for NodeArray<T> {
    #[inline]
    fn index_mut(&mut self, node: NodeId) -> &mut T {
        &mut self.slots[node.index()].value
    }
}
