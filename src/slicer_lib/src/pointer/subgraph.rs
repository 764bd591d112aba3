//! The pointer subgraph, i.e. the graph the points-to analysis operates on.
//!
//! The subgraph contains one node per pointer-relevant operation of the program.
//! Nodes are owned by a [`PointerSubgraph`] arena and referenced by [`PsNodeId`] handles.
//! The first three slots of every subgraph are taken by the sentinel locations
//! [`NULLPTR`], [`UNKNOWN_MEMORY`] and [`INVALIDATED`],
//! which are created on construction, never removed
//! and compared by handle identity.
//!
//! The frontend is responsible for wiring all operands and successors
//! before an analysis starts,
//! for pre-populating the points-to sets of `CONSTANT` nodes
//! and for keeping the successor relation consistent with the control flow
//! of the analyzed program.
//! Allocation nodes get their self-pointer populated on creation.

use super::{Offset, Pointer, PointsToSet};
use crate::prelude::*;
use std::collections::VecDeque;

/// The handle of a node inside a [`PointerSubgraph`].
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub struct PsNodeId(usize);

impl PsNodeId {
    /// Create a handle from a raw arena index.
    pub fn from_index(index: usize) -> PsNodeId {
        PsNodeId(index)
    }

    /// Get the raw arena index of the handle.
    pub fn index(&self) -> usize {
        self.0
    }
}

impl std::fmt::Display for PsNodeId {
    fn fmt(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(formatter, "ps{}", self.0)
    }
}

/// The interned handle of the null location.
pub const NULLPTR: PsNodeId = PsNodeId(0);
/// The interned handle of the unknown memory location.
pub const UNKNOWN_MEMORY: PsNodeId = PsNodeId(1);
/// The interned handle of the invalidated memory location.
pub const INVALIDATED: PsNodeId = PsNodeId(2);

/// The properties of an allocation site.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone)]
pub struct AllocationData {
    /// The size of the allocation in bytes. May be unknown.
    pub size: Offset,
    /// When true, reads at offsets without a stored value yield the null pointer.
    pub zero_initialized: bool,
    /// Whether the allocation lives on the heap.
    pub is_heap: bool,
    /// Whether the allocation is a global variable.
    pub is_global: bool,
}

/// The kind of a pointer subgraph node together with its kind-specific payload.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone)]
pub enum PsNodeKind {
    /// The sentinel node representing the null location.
    NullAddr,
    /// The sentinel node representing unknown memory.
    UnknownMem,
    /// The sentinel node representing invalidated memory.
    Invalidated,
    /// A local allocation site.
    Alloc(AllocationData),
    /// A dynamic allocation site.
    DynAlloc(AllocationData),
    /// A procedure. Pointers to it are function pointers.
    Function {
        /// The name of the procedure.
        name: String,
    },
    /// Load the pointers stored at the location the operand points to.
    Load,
    /// Store the pointers of operand 0 to the location operand 1 points to.
    Store,
    /// Shift the pointers of the operand by a constant offset.
    Gep {
        /// The byte offset added to the operand's pointers.
        offset: Offset,
    },
    /// Copy the pointers of the operand.
    Cast,
    /// Merge the pointers of all operands.
    Phi,
    /// A direct call site.
    Call,
    /// A call through a function pointer; operand 0 holds the callee pointers.
    CallFuncPtr,
    /// The value returned to a call site; operands are the callee's return nodes.
    CallReturn,
    /// A procedure return; operands are the returned values.
    Return,
    /// Copy `length` bytes between the memory the operands point to;
    /// operand 0 is the source, operand 1 the destination.
    Memcpy {
        /// The number of copied bytes. May be unknown.
        length: Offset,
    },
    /// A node with a fixed, pre-populated points-to set of exactly one pointer.
    Constant,
    /// The entry node of a procedure.
    Entry,
    /// A node without any semantics of its own.
    Noop,
    /// Release of a dynamic allocation.
    Free,
    /// Invalidation of the local variables of a returning procedure.
    InvalidateLocals,
}

/// A node of the pointer subgraph.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct PsNode {
    /// The kind of the node.
    pub kind: PsNodeKind,
    /// The ordered operand list of the node.
    pub operands: Vec<PsNodeId>,
    /// The control flow successors of the node.
    pub successors: Vec<PsNodeId>,
    /// The entry node of the procedure containing this node.
    pub parent: Option<PsNodeId>,
    /// The ID of the instruction this node was lowered from, if any.
    /// Used to attach diagnostics to program points.
    pub tid: Option<Tid>,
    /// The points-to set of the node.
    pub points_to: PointsToSet,
}

impl PsNode {
    fn new(kind: PsNodeKind) -> PsNode {
        PsNode {
            kind,
            operands: Vec::new(),
            successors: Vec::new(),
            parent: None,
            tid: None,
            points_to: PointsToSet::new(),
        }
    }

    /// Returns true if the node is an allocation site,
    /// i.e. a node that memory objects can be associated with.
    pub fn is_allocation(&self) -> bool {
        matches!(
            self.kind,
            PsNodeKind::Alloc(_) | PsNodeKind::DynAlloc(_) | PsNodeKind::Function { .. }
        )
    }

    /// The size of the allocation. Unknown for non-allocations.
    pub fn size(&self) -> Offset {
        match &self.kind {
            PsNodeKind::Alloc(data) | PsNodeKind::DynAlloc(data) => data.size,
            PsNodeKind::Function { .. } => Offset::new(0),
            _ => Offset::UNKNOWN,
        }
    }

    /// Whether unwritten offsets of the allocation read as null.
    pub fn is_zero_initialized(&self) -> bool {
        match &self.kind {
            PsNodeKind::Alloc(data) | PsNodeKind::DynAlloc(data) => data.zero_initialized,
            _ => false,
        }
    }

    /// Whether the allocation lives on the heap.
    pub fn is_heap(&self) -> bool {
        match &self.kind {
            PsNodeKind::Alloc(data) | PsNodeKind::DynAlloc(data) => data.is_heap,
            _ => false,
        }
    }

    /// Whether the allocation is a global variable or a procedure.
    pub fn is_global(&self) -> bool {
        match &self.kind {
            PsNodeKind::Alloc(data) | PsNodeKind::DynAlloc(data) => data.is_global,
            PsNodeKind::Function { .. } => true,
            _ => false,
        }
    }

    /// Mark the allocation as zero-initialized.
    /// Has no effect on non-allocations.
    pub fn set_zero_initialized(&mut self) {
        if let PsNodeKind::Alloc(data) | PsNodeKind::DynAlloc(data) = &mut self.kind {
            data.zero_initialized = true;
        }
    }

    /// Mark the allocation as no longer zero-initialized,
    /// e.g. after its whole content was overwritten.
    /// Has no effect on non-allocations.
    pub fn clear_zero_initialized(&mut self) {
        if let PsNodeKind::Alloc(data) | PsNodeKind::DynAlloc(data) = &mut self.kind {
            data.zero_initialized = false;
        }
    }
}

/// The arena owning all nodes of one pointer subgraph.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PointerSubgraph {
    nodes: Vec<PsNode>,
}

impl PointerSubgraph {
    /// Create a new subgraph containing only the three sentinel locations.
    pub fn new() -> PointerSubgraph {
        PointerSubgraph {
            nodes: vec![
                PsNode::new(PsNodeKind::NullAddr),
                PsNode::new(PsNodeKind::UnknownMem),
                PsNode::new(PsNodeKind::Invalidated),
            ],
        }
    }

    /// Add a node of the given kind to the subgraph and return its handle.
    ///
    /// Allocation nodes get their self-pointer `(self, 0)` populated here,
    /// so the corresponding invariant holds from the moment of creation.
    pub fn add_node(&mut self, kind: PsNodeKind) -> PsNodeId {
        let id = PsNodeId(self.nodes.len());
        let mut node = PsNode::new(kind);
        if node.is_allocation() {
            node.points_to.insert(Pointer::new(id, Offset::new(0)));
        }
        self.nodes.push(node);
        id
    }

    /// The number of nodes in the subgraph, including the sentinels.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the subgraph contains only the sentinels.
    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 3
    }

    /// Get a reference to a node.
    pub fn node(&self, id: PsNodeId) -> &PsNode {
        &self.nodes[id.0]
    }

    /// Get a mutable reference to a node.
    pub fn node_mut(&mut self, id: PsNodeId) -> &mut PsNode {
        &mut self.nodes[id.0]
    }

    /// Append an operand to a node.
    pub fn add_operand(&mut self, node: PsNodeId, operand: PsNodeId) {
        self.nodes[node.0].operands.push(operand);
    }

    /// Append a control flow successor to a node.
    pub fn add_successor(&mut self, node: PsNodeId, successor: PsNodeId) {
        self.nodes[node.0].successors.push(successor);
    }

    /// Get the unique successor of a node, if it has exactly one.
    pub fn single_successor(&self, node: PsNodeId) -> Option<PsNodeId> {
        match self.nodes[node.0].successors[..] {
            [successor] => Some(successor),
            _ => None,
        }
    }

    /// Insert a pointer into a node's points-to set. Returns true on change.
    pub fn add_pointer(&mut self, node: PsNodeId, pointer: Pointer) -> bool {
        self.nodes[node.0].points_to.insert(pointer)
    }

    /// Iterate over the handles of all nodes, including the sentinels.
    pub fn node_ids(&self) -> impl Iterator<Item = PsNodeId> {
        (0..self.nodes.len()).map(PsNodeId)
    }

    /// Compute, for every node, the list of nodes that use it as an operand.
    ///
    /// The index is recomputed on demand since the frontend
    /// (and the function-pointer callback during the analysis)
    /// may add nodes and operands at any time.
    pub fn users_index(&self) -> Vec<Vec<PsNodeId>> {
        let mut users = vec![Vec::new(); self.nodes.len()];
        for (index, node) in self.nodes.iter().enumerate() {
            for operand in &node.operands {
                users[operand.0].push(PsNodeId(index));
            }
        }
        users
    }

    /// Collect all nodes reachable over successor edges from the given roots,
    /// in breadth-first order. Used to seed the analysis worklist.
    pub fn bfs_order(&self, roots: impl IntoIterator<Item = PsNodeId>) -> Vec<PsNodeId> {
        let mut visited = vec![false; self.nodes.len()];
        let mut order = Vec::new();
        let mut queue: VecDeque<PsNodeId> = VecDeque::new();
        for root in roots {
            if !visited[root.0] {
                visited[root.0] = true;
                queue.push_back(root);
            }
        }
        while let Some(node) = queue.pop_front() {
            order.push(node);
            for successor in &self.nodes[node.0].successors {
                if !visited[successor.0] {
                    visited[successor.0] = true;
                    queue.push_back(*successor);
                }
            }
        }
        order
    }
}

impl Default for PointerSubgraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Shorthand for a non-heap, non-global allocation of the given size.
    pub fn local_alloc(size: u64, zero_initialized: bool) -> PsNodeKind {
        PsNodeKind::Alloc(AllocationData {
            size: Offset::new(size),
            zero_initialized,
            is_heap: false,
            is_global: false,
        })
    }

    #[test]
    fn sentinels_are_interned() {
        let subgraph = PointerSubgraph::new();
        assert_eq!(subgraph.node(NULLPTR).kind, PsNodeKind::NullAddr);
        assert_eq!(subgraph.node(UNKNOWN_MEMORY).kind, PsNodeKind::UnknownMem);
        assert_eq!(subgraph.node(INVALIDATED).kind, PsNodeKind::Invalidated);
        assert!(Pointer::null().is_null());
        assert!(!Pointer::null().is_valid());
        assert!(Pointer::unknown().is_unknown());
        assert!(Pointer::new(INVALIDATED, Offset::new(0)).is_invalidated());
    }

    #[test]
    fn allocations_point_to_themselves() {
        let mut subgraph = PointerSubgraph::new();
        let alloc = subgraph.add_node(local_alloc(16, false));
        let points_to = &subgraph.node(alloc).points_to;
        assert_eq!(points_to.len(), 1);
        assert!(points_to.contains(&Pointer::new(alloc, Offset::new(0))));
    }

    #[test]
    fn users_index_tracks_operands() {
        let mut subgraph = PointerSubgraph::new();
        let alloc = subgraph.add_node(local_alloc(8, false));
        let load = subgraph.add_node(PsNodeKind::Load);
        subgraph.add_operand(load, alloc);
        let users = subgraph.users_index();
        assert_eq!(users[alloc.index()], vec![load]);
        assert!(users[load.index()].is_empty());
    }

    #[test]
    fn bfs_order_follows_successors() {
        let mut subgraph = PointerSubgraph::new();
        let entry = subgraph.add_node(PsNodeKind::Entry);
        let first = subgraph.add_node(PsNodeKind::Noop);
        let second = subgraph.add_node(PsNodeKind::Noop);
        subgraph.add_successor(entry, first);
        subgraph.add_successor(first, second);
        subgraph.add_successor(second, first);
        assert_eq!(subgraph.bfs_order([entry]), vec![entry, first, second]);
    }
}
