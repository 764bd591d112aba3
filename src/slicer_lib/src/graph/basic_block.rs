//! Basic blocks and the control flow overlay of a dependence graph.

use super::{BlockId, DgId, DgNodeId};
use crate::prelude::*;
use std::collections::BTreeSet;

/// A basic block: an ordered list of dependence graph nodes of one procedure
/// together with its place in the control flow graph.
///
/// The post-dominator parent and the post-dominance frontier are filled in by
/// [`compute_post_dominators`](crate::analysis::post_dominance::compute_post_dominators);
/// they are `None`/empty before that.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BasicBlock {
    /// The key of the block.
    pub key: Tid,
    /// The graph the block belongs to.
    pub graph: DgId,
    /// The nodes of the block in execution order.
    pub(super) nodes: Vec<DgNodeId>,
    /// The control flow successors of the block.
    pub(super) successors: BTreeSet<BlockId>,
    /// The control flow predecessors of the block.
    pub(super) predecessors: BTreeSet<BlockId>,
    /// The immediate post-dominator of the block, once computed.
    pub ipostdom: Option<BlockId>,
    /// The post-dominance frontier of the block, once computed.
    pub pdom_frontier: BTreeSet<BlockId>,
    /// Whether the block is still part of the control flow graph.
    pub(super) alive: bool,
}

impl BasicBlock {
    pub(super) fn new(key: Tid, graph: DgId) -> BasicBlock {
        BasicBlock {
            key,
            graph,
            nodes: Vec::new(),
            successors: BTreeSet::new(),
            predecessors: BTreeSet::new(),
            ipostdom: None,
            pdom_frontier: BTreeSet::new(),
            alive: true,
        }
    }

    /// The nodes of the block in execution order.
    pub fn nodes(&self) -> &[DgNodeId] {
        &self.nodes
    }

    /// The terminator of the block, i.e. its last node.
    pub fn terminator(&self) -> Option<DgNodeId> {
        self.nodes.last().copied()
    }

    /// The control flow successors of the block.
    pub fn successors(&self) -> &BTreeSet<BlockId> {
        &self.successors
    }

    /// The control flow predecessors of the block.
    pub fn predecessors(&self) -> &BTreeSet<BlockId> {
        &self.predecessors
    }

    /// Returns true if the block is still part of the control flow graph.
    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Returns true if the block contains no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
