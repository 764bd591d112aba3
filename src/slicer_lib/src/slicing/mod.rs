//! Marking and extracting program slices.
//!
//! Slicing happens in two phases.
//! [`mark`](Slicer::mark) walks backward from a criterion node
//! over the incoming data-dependence, control-dependence and use edges
//! and tags every visited node (and its graph) with the current slice id.
//! The walk descends into callees through the parameter binding edges
//! and ascends into the callers of every graph it touches.
//! [`slice`](Slicer::slice) then removes every node
//! whose slice id differs from the current one,
//! except in procedures explicitly kept untouched.
//! Basic blocks that become empty are removed from the control flow graph,
//! which is stitched across the gap.
//! Call nodes release their callee references when removed,
//! so procedures that lose their last call site are destroyed with them.
//!
//! Slice ids are monotonically increasing.
//! Marking with id 0 allocates a fresh id;
//! passing the id of an earlier `mark` call
//! adds further criteria to the same slicing session.

use crate::graph::{BlockId, DgId, DgNodeId, SliceModule};
use std::collections::BTreeSet;
use std::collections::VecDeque;

#[cfg(test)]
mod tests;

/// The number of examined and removed nodes of the last slicing run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SliceStatistics {
    /// The number of nodes examined by the slicer.
    pub nodes_total: u64,
    /// The number of nodes removed from their graphs.
    pub nodes_removed: u64,
}

/// The slicer. One instance can perform several slicing sessions;
/// the slice id counter advances across them.
#[derive(Debug, Default)]
pub struct Slicer {
    /// Names of procedures whose bodies are never pruned.
    dont_touch: BTreeSet<String>,
    statistics: SliceStatistics,
    last_slice_id: u64,
}

impl Slicer {
    /// Create a new slicer.
    pub fn new() -> Slicer {
        Slicer::default()
    }

    /// Exclude a procedure from pruning, whatever its nodes' slice ids are.
    pub fn keep_function_untouched(&mut self, name: &str) {
        self.dont_touch.insert(name.to_string());
    }

    /// Mark the backward dependence closure of `start` with a slice id.
    ///
    /// Passing `slice_id == 0` allocates a fresh id.
    /// The id in use is returned and must be passed to [`slice`](Slicer::slice)
    /// (and to further `mark` calls for additional criteria of the same session).
    /// Marking the same criterion twice with the same id is a no-op.
    pub fn mark(&mut self, module: &mut SliceModule, start: DgNodeId, slice_id: u64) -> u64 {
        let slice_id = if slice_id == 0 {
            self.last_slice_id += 1;
            self.last_slice_id
        } else {
            self.last_slice_id = self.last_slice_id.max(slice_id);
            slice_id
        };
        let mut queue: VecDeque<DgNodeId> = VecDeque::new();
        queue.push_back(start);
        while let Some(node) = queue.pop_front() {
            if !module.node(node).is_alive() || module.node(node).slice_id == slice_id {
                continue;
            }
            module.node_mut(node).slice_id = slice_id;

            let graph = module.node(node).graph;
            if module.graph(graph).slice_id != slice_id {
                // the first marked node pulls in the procedure itself:
                // its skeleton nodes and all of its call sites
                module.graph_mut(graph).set_slice(slice_id);
                queue.extend(module.graph(graph).entry());
                queue.extend(module.graph(graph).exit());
                queue.extend(module.graph(graph).callers().iter().copied());
            }
            if let Some(callee) = module.node(node).callee {
                // keep the skeleton of the called procedure
                if module.graph(callee).is_alive() {
                    queue.extend(module.graph(callee).entry());
                    queue.extend(module.graph(callee).exit());
                }
            }
            queue.extend(module.node(node).incoming().copied());
        }
        slice_id
    }

    /// Remove all nodes not marked with the given slice id.
    ///
    /// Nodes of untouched procedures are kept regardless of their id.
    /// Emptied basic blocks are removed and the control flow graph is stitched:
    /// predecessors are redirected to the unique live successor of the removed
    /// block, or to its immediate post-dominator if several successors survive.
    pub fn slice(&mut self, module: &mut SliceModule, slice_id: u64) {
        self.statistics = SliceStatistics::default();
        let graphs: Vec<DgId> = module.graph_ids().collect();
        for graph in graphs {
            if !module.graph(graph).is_alive() {
                // already dropped by an earlier call-node removal
                continue;
            }
            if self.dont_touch.contains(&module.graph(graph).name) {
                self.statistics.nodes_total += module.graph(graph).all_node_ids().len() as u64;
                continue;
            }
            self.slice_graph(module, graph, slice_id);
        }
        // globals do not belong to any procedure, prune them separately
        for node in module.global_node_ids() {
            self.statistics.nodes_total += 1;
            if module.node(node).is_alive() && module.node(node).slice_id != slice_id {
                module.delete_node(node);
                self.statistics.nodes_removed += 1;
            }
        }
    }

    /// The `(total, removed)` node counts of the last [`slice`](Slicer::slice) call.
    pub fn get_statistics(&self) -> (u64, u64) {
        (self.statistics.nodes_total, self.statistics.nodes_removed)
    }

    fn slice_graph(&mut self, module: &mut SliceModule, graph: DgId, slice_id: u64) {
        // removal invalidates the iteration order, so collect first
        let node_ids = module.graph(graph).all_node_ids();
        self.statistics.nodes_total += node_ids.len() as u64;
        let doomed: Vec<DgNodeId> = node_ids
            .into_iter()
            .filter(|node| module.node(*node).slice_id != slice_id)
            .collect();
        for node in doomed {
            module.delete_node(node);
            self.statistics.nodes_removed += 1;
        }
        if !module.graph(graph).is_alive() {
            return;
        }
        let blocks: Vec<BlockId> = module.graph(graph).blocks().to_vec();
        for block in blocks {
            if module.block(block).is_alive() && module.block(block).is_empty() {
                module.remove_block_from_cfg(block);
            }
        }
    }
}

/// Drop the frontend's references to all procedures
/// that have no live call site left and are not in the keep list.
/// Mirrors the removal of unused functions from the sliced program.
///
/// Returns the names of the removed procedures.
pub fn remove_unused_graphs(
    module: &mut SliceModule,
    keep: &BTreeSet<String>,
) -> Vec<String> {
    let mut removed = Vec::new();
    loop {
        let unused: Vec<DgId> = module
            .graph_ids()
            .filter(|graph| {
                let graph_data = module.graph(*graph);
                !keep.contains(&graph_data.name)
                    && graph_data
                        .callers()
                        .iter()
                        .all(|caller| !module.node(*caller).is_alive())
            })
            .collect();
        if unused.is_empty() {
            return removed;
        }
        for graph in unused {
            if !module.graph(graph).is_alive() {
                // already released by a cascade in this round
                continue;
            }
            let name = module.graph(graph).name.clone();
            if module.unref_graph(graph) == 0 {
                removed.push(name);
            }
        }
    }
}
