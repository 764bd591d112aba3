//! Post-dominator trees, post-dominance frontiers and control-dependence edges.
//!
//! The post-dominator tree of a procedure is computed on the reversed control
//! flow graph of its basic blocks, rooted at the unique exit block.
//! If several blocks have no successors, a synthetic sink is added behind them.
//! The post-dominance frontier is the standard dominance frontier
//! of the reversed graph:
//! `PDF(b)` contains every block `x` such that `b` post-dominates a successor
//! of `x` but not `x` itself.
//!
//! A node `u` is control-dependent on the terminator of a block `v`
//! iff `v` lies in the post-dominance frontier of the block of `u`.

use crate::graph::{BlockId, DgId, SliceModule};
use fnv::FnvHashMap;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Reversed;
use std::collections::BTreeSet;

/// Compute the immediate post-dominator of every alive block of the graph,
/// and the post-dominance frontiers if `with_frontier` is set.
///
/// The results are stored in the blocks themselves.
/// Blocks post-dominated only by the synthetic sink
/// (e.g. the returning blocks of the procedure) get no immediate post-dominator.
pub fn compute_post_dominators(module: &mut SliceModule, graph: DgId, with_frontier: bool) {
    let blocks: Vec<BlockId> = module
        .graph(graph)
        .blocks()
        .iter()
        .copied()
        .filter(|block| module.block(*block).is_alive())
        .collect();
    if blocks.is_empty() {
        return;
    }

    let mut cfg: DiGraph<Option<BlockId>, ()> = DiGraph::new();
    let mut indices: FnvHashMap<BlockId, NodeIndex> = FnvHashMap::default();
    for block in &blocks {
        indices.insert(*block, cfg.add_node(Some(*block)));
    }
    for block in &blocks {
        for successor in module.block(*block).successors() {
            if let Some(successor_index) = indices.get(successor) {
                cfg.add_edge(indices[block], *successor_index, ());
            }
        }
    }

    // route all exits through a unique sink the tree can be rooted at
    let exits: Vec<NodeIndex> = blocks
        .iter()
        .filter(|block| {
            module
                .block(**block)
                .successors()
                .iter()
                .all(|successor| !indices.contains_key(successor))
        })
        .map(|block| indices[block])
        .collect();
    let root = match exits[..] {
        [unique] => unique,
        _ => {
            let sink = cfg.add_node(None);
            for exit in exits {
                cfg.add_edge(exit, sink, ());
            }
            sink
        }
    };

    let dominators = petgraph::algo::dominators::simple_fast(Reversed(&cfg), root);
    let mut ipostdom: FnvHashMap<BlockId, Option<BlockId>> = FnvHashMap::default();
    for block in &blocks {
        let parent = dominators
            .immediate_dominator(indices[block])
            .and_then(|index| *cfg.node_weight(index).unwrap());
        ipostdom.insert(*block, parent);
        module.block_mut(*block).ipostdom = parent;
    }

    if !with_frontier {
        return;
    }
    // standard frontier computation, walking the post-dominator tree
    // upwards from every successor of a branching block
    let mut frontiers: FnvHashMap<BlockId, BTreeSet<BlockId>> = FnvHashMap::default();
    for block in &blocks {
        let successors: Vec<BlockId> = module
            .block(*block)
            .successors()
            .iter()
            .copied()
            .filter(|successor| indices.contains_key(successor))
            .collect();
        if successors.len() < 2 {
            continue;
        }
        let parent = ipostdom[block];
        for successor in successors {
            let mut runner = Some(successor);
            while let Some(current) = runner {
                if Some(current) == parent {
                    break;
                }
                frontiers.entry(current).or_default().insert(*block);
                runner = ipostdom.get(&current).copied().flatten();
            }
        }
    }
    for block in &blocks {
        module.block_mut(*block).pdom_frontier =
            frontiers.remove(block).unwrap_or_default();
    }
}

/// Add the control-dependence edges of one procedure.
///
/// For every block `b` and every block `v` in the post-dominance frontier of `b`,
/// every node of `b` becomes control-dependent on the terminator of `v`.
/// Returns the number of added edges.
pub fn add_control_dependence_edges(module: &mut SliceModule, graph: DgId) -> usize {
    let blocks: Vec<BlockId> = module
        .graph(graph)
        .blocks()
        .iter()
        .copied()
        .filter(|block| module.block(*block).is_alive())
        .collect();
    let mut added = 0;
    for block in blocks {
        let controlling: Vec<BlockId> = module.block(block).pdom_frontier.iter().copied().collect();
        if controlling.is_empty() {
            continue;
        }
        let dependent: Vec<_> = module.block(block).nodes().to_vec();
        for controller in controlling {
            let Some(terminator) = module.block(controller).terminator() else {
                continue;
            };
            for node in &dependent {
                if module.add_control_edge(terminator, *node) {
                    added += 1;
                }
            }
        }
    }
    added
}
