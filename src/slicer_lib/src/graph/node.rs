//! The nodes of the dependence graphs.

use super::{BlockId, DgId, DgNodeId};
use crate::prelude::*;
use std::collections::BTreeSet;

/// A node of a dependence graph,
/// corresponding to one instruction or parameter of a procedure.
///
/// A node owns three kinds of outgoing edges
/// (data dependence, control dependence and use edges)
/// together with their reverse indices.
/// Edges may connect nodes of different graphs,
/// e.g. for parameter bindings at call boundaries.
/// All edges are added and removed through the owning
/// [`SliceModule`](super::SliceModule),
/// which keeps the reverse indices consistent.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DgNode {
    /// The key of the node, unique inside its graph.
    pub key: Tid,
    /// The graph the node belongs to.
    pub graph: DgId,
    /// The basic block containing the node, if any.
    pub block: Option<BlockId>,
    /// For call nodes: the dependence graph of the called procedure.
    pub callee: Option<DgId>,
    /// The slice id of the node.
    /// The node is part of the current slice iff this equals the current slice id.
    pub slice_id: u64,
    /// Whether the node has been destroyed.
    pub(super) alive: bool,
    pub(super) data_deps: BTreeSet<DgNodeId>,
    pub(super) rev_data_deps: BTreeSet<DgNodeId>,
    pub(super) control_deps: BTreeSet<DgNodeId>,
    pub(super) rev_control_deps: BTreeSet<DgNodeId>,
    pub(super) use_deps: BTreeSet<DgNodeId>,
    pub(super) rev_use_deps: BTreeSet<DgNodeId>,
}

impl DgNode {
    pub(super) fn new(key: Tid, graph: DgId) -> DgNode {
        DgNode {
            key,
            graph,
            block: None,
            callee: None,
            slice_id: 0,
            alive: true,
            data_deps: BTreeSet::new(),
            rev_data_deps: BTreeSet::new(),
            control_deps: BTreeSet::new(),
            rev_control_deps: BTreeSet::new(),
            use_deps: BTreeSet::new(),
            rev_use_deps: BTreeSet::new(),
        }
    }

    /// Returns true if the node has not been destroyed.
    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// The nodes that are data-dependent on this node.
    pub fn data_deps(&self) -> &BTreeSet<DgNodeId> {
        &self.data_deps
    }

    /// The nodes this node is data-dependent on.
    pub fn rev_data_deps(&self) -> &BTreeSet<DgNodeId> {
        &self.rev_data_deps
    }

    /// The nodes that are control-dependent on this node.
    pub fn control_deps(&self) -> &BTreeSet<DgNodeId> {
        &self.control_deps
    }

    /// The nodes this node is control-dependent on.
    pub fn rev_control_deps(&self) -> &BTreeSet<DgNodeId> {
        &self.rev_control_deps
    }

    /// The nodes that use the value defined by this node.
    pub fn use_deps(&self) -> &BTreeSet<DgNodeId> {
        &self.use_deps
    }

    /// The nodes defining the values this node uses.
    pub fn rev_use_deps(&self) -> &BTreeSet<DgNodeId> {
        &self.rev_use_deps
    }

    /// All nodes with an edge ending in this node,
    /// i.e. the neighbors a backward slice walk continues to.
    pub fn incoming(&self) -> impl Iterator<Item = &DgNodeId> {
        self.rev_data_deps
            .iter()
            .chain(self.rev_control_deps.iter())
            .chain(self.rev_use_deps.iter())
    }

    /// The total number of edges incident to this node.
    pub fn degree(&self) -> usize {
        self.data_deps.len()
            + self.rev_data_deps.len()
            + self.control_deps.len()
            + self.rev_control_deps.len()
            + self.use_deps.len()
            + self.rev_use_deps.len()
    }
}
