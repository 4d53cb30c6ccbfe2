//! Chain - doubly-linked lists over caller-owned node storage
//!
//! Every list in the core (ready set, thread queue waiters, free lists of
//! control blocks, the watchdog delta chain) is a [`Chain`]. A chain never
//! owns its nodes. The nodes live in some storage implementing [`Nodes`]
//! (usually a [`NodeArray`]), each carrying one [`Links`] field, and a node is
//! on at most one chain per links field at a time.
//!
//! ## Sentinels
//!
//! The control block plays both sentinels at once. [`Position::Head`] stands
//! for the control block as the predecessor of the first node and
//! [`Position::Tail`] for the control block as the successor of the last one:
//!
//! ```text
//!   Head -> [n3] -> [n0] -> [n7] -> Tail
//!   Head <- [n3] <- [n0] <- [n7] <- Tail
//! ```
//!
//! An empty chain has `first == Tail` and `last == Head`, so emptiness is
//! exactly "the first position is the tail sentinel", and insertion/removal
//! never needs an empty special case.
//!
//! ## Protected and unprotected forms
//!
//! The `*_unprotected` operations assume the caller already serializes
//! access to the chain and its nodes. [`ProtectedChain`] bundles a chain with
//! its node storage inside an [`IsrLock`] and offers the same mutations as
//! interrupt-atomic operations. A chain that an interrupt handler may touch
//! must only ever be mutated through the protected forms or under the lock
//! that the handler also takes.

mod array;

pub use array::NodeArray;

use core::fmt;

use crate::sync::IsrLock;

/// Index of a node inside its storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u32);

impl NodeId {
    /// Node at `index` in its storage
    #[inline]
    pub const fn new(index: usize) -> Self {
        Self(index as u32)
    }

    /// Storage index of this node
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// A place in a chain: one of the two sentinels or a real node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Position {
    /// The control block acting as predecessor of the first node
    Head,
    /// A node in the chain
    Node(NodeId),
    /// The control block acting as successor of the last node
    Tail,
}

impl Position {
    /// The node at this position, if it is not a sentinel
    #[inline]
    pub fn node(self) -> Option<NodeId> {
        match self {
            Position::Node(node) => Some(node),
            _ => None,
        }
    }
}

/// The forward and backward links embedded in every node
///
/// The links are only meaningful while the node is on a chain. A node taken
/// off a chain is marked with [`Links::OFF_CHAIN`], a combination no chained
/// node can have (nothing links forward to the head sentinel).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Links {
    next: Position,
    previous: Position,
}

impl Links {
    /// Marker for a node that is not on any chain
    pub const OFF_CHAIN: Links = Links {
        next: Position::Head,
        previous: Position::Tail,
    };

    /// Successor of this node
    #[inline]
    pub fn next(&self) -> Position {
        self.next
    }

    /// Predecessor of this node
    #[inline]
    pub fn previous(&self) -> Position {
        self.previous
    }

    /// Whether the node is marked as off any chain
    #[inline]
    pub fn is_off_chain(&self) -> bool {
        self.next == Position::Head
    }

    /// Mark the node as off any chain
    #[inline]
    pub fn set_off_chain(&mut self) {
        *self = Self::OFF_CHAIN;
    }
}

impl Default for Links {
    fn default() -> Self {
        Self::OFF_CHAIN
    }
}

/// Storage that holds chain nodes
pub trait Nodes {
    /// Links of `node`
    fn links(&self, node: NodeId) -> &Links;

    /// Mutable links of `node`
    fn links_mut(&mut self, node: NodeId) -> &mut Links;
}

/// Chain control block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chain {
    first: Position,
    last: Position,
}

impl Chain {
    /// Create an empty chain
    pub const fn new() -> Self {
        Self {
            first: Position::Tail,
            last: Position::Head,
        }
    }

    /// Reset the control block to the empty chain
    ///
    /// Nodes that were on the chain are not touched and must not be
    /// traversed afterwards.
    pub fn initialize_empty(&mut self) {
        *self = Self::new();
    }

    /// Link the first `node_count` nodes of `nodes` into this chain, in
    /// storage order
    ///
    /// Any previous content of the chain is forgotten.
    pub fn initialize<N: Nodes>(&mut self, nodes: &mut N, node_count: usize) {
        self.initialize_empty();
        for index in 0..node_count {
            self.append_unprotected(nodes, NodeId::new(index));
        }
    }

    /// First position after the head sentinel (the tail sentinel when empty)
    #[inline]
    pub fn first(&self) -> Position {
        self.first
    }

    /// Last position before the tail sentinel (the head sentinel when empty)
    #[inline]
    pub fn last(&self) -> Position {
        self.last
    }

    /// First node, if any
    #[inline]
    pub fn first_node(&self) -> Option<NodeId> {
        self.first.node()
    }

    /// Last node, if any
    #[inline]
    pub fn last_node(&self) -> Option<NodeId> {
        self.last.node()
    }

    /// Whether the chain has no nodes
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.first == Position::Tail
    }

    /// Whether the chain has exactly one node
    #[inline]
    pub fn has_only_one_node(&self) -> bool {
        !self.is_empty() && self.first == self.last
    }

    /// Whether `position` is the head sentinel
    #[inline]
    pub fn is_head(position: Position) -> bool {
        position == Position::Head
    }

    /// Whether `position` is the tail sentinel
    #[inline]
    pub fn is_tail(position: Position) -> bool {
        position == Position::Tail
    }

    /// Whether `node` is the first node of the chain it is on
    #[inline]
    pub fn is_first<N: Nodes>(nodes: &N, node: NodeId) -> bool {
        nodes.links(node).previous == Position::Head
    }

    /// Whether `node` is the last node of the chain it is on
    #[inline]
    pub fn is_last<N: Nodes>(nodes: &N, node: NodeId) -> bool {
        nodes.links(node).next == Position::Tail
    }

    /// Whether two positions refer to the same node or sentinel
    #[inline]
    pub fn are_nodes_equal(left: Position, right: Position) -> bool {
        left == right
    }

    /// Successor of `position`
    ///
    /// The tail sentinel has no successor and maps to itself.
    pub fn next<N: Nodes>(&self, nodes: &N, position: Position) -> Position {
        match position {
            Position::Head => self.first,
            Position::Node(node) => nodes.links(node).next,
            Position::Tail => Position::Tail,
        }
    }

    /// Predecessor of `position`
    ///
    /// The head sentinel has no predecessor and maps to itself.
    pub fn previous<N: Nodes>(&self, nodes: &N, position: Position) -> Position {
        match position {
            Position::Head => Position::Head,
            Position::Node(node) => nodes.links(node).previous,
            Position::Tail => self.last,
        }
    }

    fn set_next<N: Nodes>(&mut self, nodes: &mut N, position: Position, next: Position) {
        match position {
            Position::Head => self.first = next,
            Position::Node(node) => nodes.links_mut(node).next = next,
            Position::Tail => debug_assert!(false, "tail sentinel has no successor"),
        }
    }

    fn set_previous<N: Nodes>(&mut self, nodes: &mut N, position: Position, previous: Position) {
        match position {
            Position::Head => debug_assert!(false, "head sentinel has no predecessor"),
            Position::Node(node) => nodes.links_mut(node).previous = previous,
            Position::Tail => self.last = previous,
        }
    }

    /// Remove `node` from this chain in O(1)
    ///
    /// `node` must currently be on this chain. It is left marked off-chain.
    pub fn extract_unprotected<N: Nodes>(&mut self, nodes: &mut N, node: NodeId) {
        let Links { next, previous } = *nodes.links(node);
        debug_assert!(next != Position::Head, "extracting a node that is off chain");

        self.set_next(nodes, previous, next);
        self.set_previous(nodes, next, previous);
        nodes.links_mut(node).set_off_chain();
    }

    /// Remove and return the first node, or `None` when empty
    pub fn get_unprotected<N: Nodes>(&mut self, nodes: &mut N) -> Option<NodeId> {
        let node = self.first.node()?;
        self.extract_unprotected(nodes, node);
        Some(node)
    }

    /// Remove and return the first node of a chain known to be non-empty
    pub fn get_first_unprotected<N: Nodes>(&mut self, nodes: &mut N) -> NodeId {
        debug_assert!(!self.is_empty(), "get_first on an empty chain");
        let node = match self.first {
            Position::Node(node) => node,
            _ => unreachable!("chain is not empty"),
        };
        self.extract_unprotected(nodes, node);
        node
    }

    /// Insert `node` right after `after`
    ///
    /// `after` is the head sentinel or a node on this chain; `node` must be
    /// off every chain using the same links.
    pub fn insert_unprotected<N: Nodes>(&mut self, nodes: &mut N, after: Position, node: NodeId) {
        debug_assert!(after != Position::Tail, "cannot insert after the tail sentinel");
        let before = self.next(nodes, after);

        {
            let links = nodes.links_mut(node);
            links.previous = after;
            links.next = before;
        }
        self.set_next(nodes, after, Position::Node(node));
        self.set_previous(nodes, before, Position::Node(node));
    }

    /// Insert `node` at the end
    pub fn append_unprotected<N: Nodes>(&mut self, nodes: &mut N, node: NodeId) {
        let last = self.last;
        self.insert_unprotected(nodes, last, node);
    }

    /// Insert `node` at the front
    pub fn prepend_unprotected<N: Nodes>(&mut self, nodes: &mut N, node: NodeId) {
        self.insert_unprotected(nodes, Position::Head, node);
    }

    /// Append `node` only if it is currently off chain; returns whether it
    /// was appended
    pub fn append_if_is_off_chain_unprotected<N: Nodes>(
        &mut self,
        nodes: &mut N,
        node: NodeId,
    ) -> bool {
        if nodes.links(node).is_off_chain() {
            self.append_unprotected(nodes, node);
            true
        } else {
            false
        }
    }

    /// Insert `node` before the first node it precedes according to
    /// `precedes(nodes, node, other)`
    ///
    /// Nodes that `node` does not precede stay in front of it, so equal keys
    /// keep their arrival order.
    pub fn insert_ordered_unprotected<N, F>(&mut self, nodes: &mut N, node: NodeId, mut precedes: F)
    where
        N: Nodes,
        F: FnMut(&N, NodeId, NodeId) -> bool,
    {
        let mut after = Position::Head;
        let mut cursor = self.first;

        while let Position::Node(other) = cursor {
            if precedes(&*nodes, node, other) {
                break;
            }
            after = cursor;
            cursor = nodes.links(other).next;
        }

        self.insert_unprotected(nodes, after, node);
    }

    /// Count the nodes by walking the chain
    pub fn node_count_unprotected<N: Nodes>(&self, nodes: &N) -> usize {
        self.iter(nodes).count()
    }

    /// Iterate the nodes from first to last
    pub fn iter<'a, N: Nodes>(&self, nodes: &'a N) -> Iter<'a, N> {
        Iter {
            nodes,
            cursor: self.first,
        }
    }
}

impl Default for Chain {
    fn default() -> Self {
        Self::new()
    }
}

/// Forward iterator over a chain
pub struct Iter<'a, N> {
    nodes: &'a N,
    cursor: Position,
}

impl<N: Nodes> Iterator for Iter<'_, N> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let node = self.cursor.node()?;
        self.cursor = self.nodes.links(node).next;
        Some(node)
    }
}

/// A chain together with the storage of its nodes
#[derive(Debug, Default)]
pub struct ChainBlock<N> {
    pub chain: Chain,
    pub nodes: N,
}

/// A chain whose every mutation is interrupt-atomic
///
/// Each operation takes the ISR lock for its duration, so it can be used
/// from thread context and interrupt handlers alike.
#[derive(Debug)]
pub struct ProtectedChain<N> {
    block: IsrLock<ChainBlock<N>>,
}

impl<N: Nodes> ProtectedChain<N> {
    /// Wrap `nodes` with an empty chain
    pub const fn new(name: &'static str, nodes: N) -> Self {
        Self {
            block: IsrLock::new(
                name,
                ChainBlock {
                    chain: Chain::new(),
                    nodes,
                },
            ),
        }
    }

    /// Wrap `nodes` with a chain linking the first `node_count` nodes
    pub fn with_nodes(name: &'static str, mut nodes: N, node_count: usize) -> Self {
        let mut chain = Chain::new();
        chain.initialize(&mut nodes, node_count);
        Self {
            block: IsrLock::new(name, ChainBlock { chain, nodes }),
        }
    }

    /// Interrupt-atomic [`Chain::append_unprotected`]
    pub fn append(&self, node: NodeId) {
        let mut block = self.block.lock();
        let ChainBlock { chain, nodes } = &mut *block;
        chain.append_unprotected(nodes, node);
    }

    /// Interrupt-atomic [`Chain::prepend_unprotected`]
    pub fn prepend(&self, node: NodeId) {
        let mut block = self.block.lock();
        let ChainBlock { chain, nodes } = &mut *block;
        chain.prepend_unprotected(nodes, node);
    }

    /// Interrupt-atomic [`Chain::insert_unprotected`]
    pub fn insert_after(&self, after: Position, node: NodeId) {
        let mut block = self.block.lock();
        let ChainBlock { chain, nodes } = &mut *block;
        chain.insert_unprotected(nodes, after, node);
    }

    /// Interrupt-atomic [`Chain::extract_unprotected`]
    pub fn extract(&self, node: NodeId) {
        let mut block = self.block.lock();
        let ChainBlock { chain, nodes } = &mut *block;
        chain.extract_unprotected(nodes, node);
    }

    /// Interrupt-atomic [`Chain::get_unprotected`]
    pub fn get(&self) -> Option<NodeId> {
        let mut block = self.block.lock();
        let ChainBlock { chain, nodes } = &mut *block;
        chain.get_unprotected(nodes)
    }

    /// Whether the chain is empty at this instant
    pub fn is_empty(&self) -> bool {
        self.block.lock().chain.is_empty()
    }

    /// Run `f` with the chain locked, for compound operations
    pub fn with_locked<R>(&self, f: impl FnOnce(&mut Chain, &mut N) -> R) -> R {
        let mut block = self.block.lock();
        let ChainBlock { chain, nodes } = &mut *block;
        f(chain, nodes)
    }

    /// Give the storage back
    pub fn into_inner(self) -> ChainBlock<N> {
        self.block.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    fn collect(chain: &Chain, nodes: &NodeArray<u32>) -> Vec<u32> {
        chain.iter(nodes).map(|node| nodes[node]).collect()
    }

    fn collect_backward(chain: &Chain, nodes: &NodeArray<u32>) -> Vec<u32> {
        let mut values = Vec::new();
        let mut cursor = chain.last();
        while let Position::Node(node) = cursor {
            values.push(nodes[node]);
            cursor = chain.previous(nodes, cursor);
        }
        values.reverse();
        values
    }

    #[test]
    fn chain_initialize_empty() {
        let mut chain = Chain::new();
        chain.initialize_empty();
        assert!(chain.is_empty());
        assert!(Chain::is_tail(chain.first()));
        assert!(Chain::is_head(chain.last()));
        assert!(!chain.has_only_one_node());
        assert_eq!(chain.first_node(), None);
    }

    #[test]
    fn chain_initialize_links_in_storage_order() {
        let mut nodes = NodeArray::from_fn(4, |index| index as u32 * 10);
        let mut chain = Chain::new();
        chain.initialize(&mut nodes, 4);

        assert!(!chain.is_empty());
        assert_eq!(collect(&chain, &nodes), [0, 10, 20, 30]);
        assert!(Chain::is_first(&nodes, NodeId::new(0)));
        assert!(Chain::is_last(&nodes, NodeId::new(3)));
        assert_eq!(chain.node_count_unprotected(&nodes), 4);
    }

    #[test]
    fn chain_append_prepend_extract() {
        let mut nodes = NodeArray::from_fn(3, |index| index as u32);
        let mut chain = Chain::new();

        chain.append_unprotected(&mut nodes, NodeId::new(1));
        assert!(chain.has_only_one_node());
        chain.append_unprotected(&mut nodes, NodeId::new(2));
        chain.prepend_unprotected(&mut nodes, NodeId::new(0));
        assert_eq!(collect(&chain, &nodes), [0, 1, 2]);

        chain.extract_unprotected(&mut nodes, NodeId::new(1));
        assert!(nodes.links(NodeId::new(1)).is_off_chain());
        assert_eq!(collect(&chain, &nodes), [0, 2]);
        assert_eq!(collect_backward(&chain, &nodes), [0, 2]);

        assert_eq!(chain.get_unprotected(&mut nodes), Some(NodeId::new(0)));
        assert_eq!(chain.get_first_unprotected(&mut nodes), NodeId::new(2));
        assert_eq!(chain.get_unprotected(&mut nodes), None);
        assert!(chain.is_empty());
    }

    #[test]
    fn chain_insert_after_node() {
        let mut nodes = NodeArray::from_fn(3, |index| index as u32);
        let mut chain = Chain::new();
        chain.append_unprotected(&mut nodes, NodeId::new(0));
        chain.append_unprotected(&mut nodes, NodeId::new(2));
        chain.insert_unprotected(&mut nodes, Position::Node(NodeId::new(0)), NodeId::new(1));

        assert_eq!(collect(&chain, &nodes), [0, 1, 2]);
        assert_eq!(
            chain.next(&nodes, Position::Node(NodeId::new(0))),
            Position::Node(NodeId::new(1))
        );
        assert_eq!(
            chain.previous(&nodes, Position::Node(NodeId::new(2))),
            Position::Node(NodeId::new(1))
        );
    }

    #[test]
    fn chain_insert_ordered_is_stable() {
        // (key, arrival)
        let mut nodes = NodeArray::from_fn(5, |index| [5, 3, 3, 7, 3][index]);
        let mut chain = Chain::new();
        for index in 0..5 {
            chain.insert_ordered_unprotected(&mut nodes, NodeId::new(index), |nodes, new, other| {
                nodes[new] < nodes[other]
            });
        }

        let order: Vec<usize> = chain.iter(&nodes).map(NodeId::index).collect();
        assert_eq!(order, [1, 2, 4, 0, 3]);
    }

    #[test]
    fn chain_append_if_off_chain() {
        let mut nodes = NodeArray::from_fn(1, |_| 0u32);
        let mut chain = Chain::new();
        assert!(chain.append_if_is_off_chain_unprotected(&mut nodes, NodeId::new(0)));
        assert!(!chain.append_if_is_off_chain_unprotected(&mut nodes, NodeId::new(0)));
        assert!(chain.has_only_one_node());
    }

    #[test]
    fn chain_forward_and_backward_walks_agree() {
        // Deterministic pseudo-random operation sequence
        let mut seed: u32 = 0x2545_f491;
        let mut next_random = move || {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            seed
        };

        const COUNT: usize = 16;
        let mut nodes = NodeArray::from_fn(COUNT, |index| index as u32);
        let mut chain = Chain::new();
        let mut on_chain = [false; COUNT];

        for _ in 0..2_000 {
            let index = next_random() as usize % COUNT;
            let node = NodeId::new(index);
            if on_chain[index] {
                chain.extract_unprotected(&mut nodes, node);
                on_chain[index] = false;
            } else if next_random() % 2 == 0 {
                chain.append_unprotected(&mut nodes, node);
                on_chain[index] = true;
            } else {
                chain.prepend_unprotected(&mut nodes, node);
                on_chain[index] = true;
            }

            let forward = collect(&chain, &nodes);
            assert_eq!(forward, collect_backward(&chain, &nodes));
            assert_eq!(chain.is_empty(), Chain::is_tail(chain.first()));
            assert_eq!(chain.is_empty(), forward.is_empty());
            assert_eq!(forward.len(), on_chain.iter().filter(|&&on| on).count());
        }
    }

    #[test]
    fn protected_chain_operations() {
        let chain =
            ProtectedChain::with_nodes("free", NodeArray::from_fn(3, |index| index as u32), 2);
        assert!(!chain.is_empty());

        chain.append(NodeId::new(2));
        assert_eq!(chain.get(), Some(NodeId::new(0)));
        chain.prepend(NodeId::new(0));
        chain.extract(NodeId::new(1));
        chain.insert_after(Position::Node(NodeId::new(0)), NodeId::new(1));

        let order = chain.with_locked(|chain, nodes| {
            chain.iter(nodes).map(NodeId::index).collect::<Vec<_>>()
        });
        assert_eq!(order, [0, 1, 2]);

        let block = chain.into_inner();
        assert_eq!(block.chain.node_count_unprotected(&block.nodes), 3);
    }
}
