//! A may-reach analysis of memory definitions over the basic block graph.
//!
//! The analysis tracks, per memory location, the set of nodes
//! whose definition of that location may still be observable.
//! A location is an allocation site of the pointer subgraph
//! together with an offset range.
//! Writes through a must-alias singleton pointer at a concrete offset
//! kill the prior definitions of the overwritten range,
//! every other write is a may-definition.
//!
//! The block-level fixpoint is computed with the generic
//! [fixpoint harness](super::fixpoint);
//! the per-instruction reaching sets are obtained afterwards
//! by replaying the block from its entry value.

use super::fixpoint::{Computation, Context};
use crate::graph::{BlockId, DgId, DgNodeId, SliceModule};
use crate::pointer::subgraph::PsNodeId;
use crate::pointer::Offset;
use fnv::FnvHashMap;
use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use std::collections::{BTreeMap, BTreeSet};

/// A memory location: an offset range inside an allocation.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub struct MemLoc {
    /// The allocation site of the location.
    pub alloc: PsNodeId,
    /// The start offset of the range.
    pub offset: Offset,
    /// The length of the range in bytes.
    pub length: Offset,
}

impl MemLoc {
    /// Create a new memory location.
    pub fn new(alloc: PsNodeId, offset: Offset, length: Offset) -> MemLoc {
        MemLoc {
            alloc,
            offset,
            length,
        }
    }

    /// Returns true if the two locations may refer to overlapping memory.
    /// Unknown offsets overlap everything inside the same allocation,
    /// ranges with unknown length extend to the end of the allocation.
    pub fn overlaps(&self, other: &MemLoc) -> bool {
        if self.alloc != other.alloc {
            return false;
        }
        if self.offset.is_unknown() || other.offset.is_unknown() {
            return true;
        }
        match (self.length.is_unknown(), other.length.is_unknown()) {
            (true, true) => true,
            (true, false) => self.offset.lt(&(other.offset + other.length)),
            (false, true) => other.offset.lt(&(self.offset + self.length)),
            (false, false) => {
                self.offset.lt(&(other.offset + other.length))
                    && other.offset.lt(&(self.offset + self.length))
            }
        }
    }

    /// Returns true if this location completely covers the other one,
    /// so that a write to it overwrites the other location entirely.
    /// Only concrete ranges can cover anything.
    pub fn covers(&self, other: &MemLoc) -> bool {
        if self.alloc != other.alloc
            || self.offset.is_unknown()
            || self.length.is_unknown()
            || other.offset.is_unknown()
            || other.length.is_unknown()
        {
            return false;
        }
        self.offset.le(&other.offset) && (other.offset + other.length).le(&(self.offset + self.length))
    }
}

/// One memory definition made by a node.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct DefSite {
    /// The written location.
    pub location: MemLoc,
    /// Whether the write definitely happens and definitely hits this location,
    /// so that it kills the prior definitions of the covered range.
    pub is_strong: bool,
}

/// Maps memory locations to the nodes whose definitions may reach a program point.
pub type DefMap = BTreeMap<MemLoc, BTreeSet<DgNodeId>>;

/// The reaching-definitions analysis of a single procedure.
pub struct ReachingDefsAnalysis<'a> {
    module: &'a SliceModule,
    graph: DgId,
    /// The memory definitions of every defining node, prepared by the frontend.
    defs: &'a FnvHashMap<DgNodeId, Vec<DefSite>>,
}

struct BlockFlowContext<'a> {
    analysis: &'a ReachingDefsAnalysis<'a>,
    cfg: DiGraph<BlockId, ()>,
}

impl<'a> Context for BlockFlowContext<'a> {
    type EdgeLabel = ();
    type NodeLabel = BlockId;
    type NodeValue = DefMap;

    fn get_graph(&self) -> &DiGraph<BlockId, ()> {
        &self.cfg
    }

    fn merge(&self, value1: &DefMap, value2: &DefMap) -> DefMap {
        let mut merged = value1.clone();
        for (location, nodes) in value2 {
            merged
                .entry(*location)
                .or_default()
                .extend(nodes.iter().copied());
        }
        merged
    }

    fn update_edge(&self, value: &DefMap, edge: EdgeIndex) -> Option<DefMap> {
        let (start, _) = self.cfg.edge_endpoints(edge).unwrap();
        let block = self.cfg[start];
        Some(self.analysis.transfer_block(block, value.clone()))
    }
}

impl<'a> ReachingDefsAnalysis<'a> {
    /// Create a new analysis for the given procedure.
    pub fn new(
        module: &'a SliceModule,
        graph: DgId,
        defs: &'a FnvHashMap<DgNodeId, Vec<DefSite>>,
    ) -> ReachingDefsAnalysis<'a> {
        ReachingDefsAnalysis {
            module,
            graph,
            defs,
        }
    }

    /// Run the analysis to its fixpoint
    /// and return the definitions reaching the entry of every block.
    pub fn run(&self) -> ReachingDefsResults {
        let blocks: Vec<BlockId> = self
            .module
            .graph(self.graph)
            .blocks()
            .iter()
            .copied()
            .filter(|block| self.module.block(*block).is_alive())
            .collect();
        let mut cfg: DiGraph<BlockId, ()> = DiGraph::new();
        let mut indices: FnvHashMap<BlockId, NodeIndex> = FnvHashMap::default();
        for block in &blocks {
            indices.insert(*block, cfg.add_node(*block));
        }
        for block in &blocks {
            for successor in self.module.block(*block).successors() {
                if let Some(successor_index) = indices.get(successor) {
                    cfg.add_edge(indices[block], *successor_index, ());
                }
            }
        }
        let context = BlockFlowContext {
            analysis: self,
            cfg,
        };
        let mut computation = Computation::new(context, None);
        if let Some(entry_block) = self.module.graph(self.graph).entry_block() {
            if let Some(entry_index) = indices.get(&entry_block) {
                computation.set_node_value(*entry_index, DefMap::new());
            }
        } else {
            // without a designated entry, seed every block
            for index in indices.values() {
                computation.set_node_value(*index, DefMap::new());
            }
        }
        computation.compute();

        let mut block_entry: FnvHashMap<BlockId, DefMap> = FnvHashMap::default();
        for (block, index) in &indices {
            if let Some(value) = computation.get_node_value(*index) {
                block_entry.insert(*block, value.clone());
            }
        }
        ReachingDefsResults { block_entry }
    }

    /// Apply the definitions of all nodes of a block to the given map.
    fn transfer_block(&self, block: BlockId, mut value: DefMap) -> DefMap {
        for node in self.module.block(block).nodes() {
            self.transfer_node(*node, &mut value);
        }
        value
    }

    /// Apply the definitions of a single node to the given map.
    fn transfer_node(&self, node: DgNodeId, value: &mut DefMap) {
        let Some(def_sites) = self.defs.get(&node) else {
            return;
        };
        for def_site in def_sites {
            if def_site.is_strong {
                value.retain(|location, _| !def_site.location.covers(location));
            }
            value
                .entry(def_site.location)
                .or_default()
                .insert(node);
        }
    }

    /// Compute the definitions reaching the given node
    /// by replaying its block from the block's entry value.
    pub fn reaching_at(&self, results: &ReachingDefsResults, node: DgNodeId) -> DefMap {
        let Some(block) = self.module.node(node).block else {
            return DefMap::new();
        };
        let mut value = results
            .block_entry
            .get(&block)
            .cloned()
            .unwrap_or_default();
        for member in self.module.block(block).nodes() {
            if *member == node {
                break;
            }
            self.transfer_node(*member, &mut value);
        }
        value
    }
}

/// The result of a reaching-definitions analysis:
/// the definitions reaching the entry of every block of the procedure.
pub struct ReachingDefsResults {
    block_entry: FnvHashMap<BlockId, DefMap>,
}

impl ReachingDefsResults {
    /// The definitions reaching the entry of the given block.
    pub fn at_block_entry(&self, block: BlockId) -> Option<&DefMap> {
        self.block_entry.get(&block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prelude::*;

    fn word_at(alloc: PsNodeId, offset: u64) -> MemLoc {
        MemLoc::new(alloc, Offset::new(offset), Offset::new(8))
    }

    #[test]
    fn overlap_rules() {
        let alloc = PsNodeId::from_index(3);
        let other_alloc = PsNodeId::from_index(4);
        assert!(word_at(alloc, 0).overlaps(&word_at(alloc, 4)));
        assert!(!word_at(alloc, 0).overlaps(&word_at(alloc, 8)));
        assert!(!word_at(alloc, 0).overlaps(&word_at(other_alloc, 0)));
        let unknown = MemLoc::new(alloc, Offset::UNKNOWN, Offset::new(8));
        assert!(unknown.overlaps(&word_at(alloc, 64)));
        assert!(word_at(alloc, 64).overlaps(&unknown));
    }

    #[test]
    fn cover_rules() {
        let alloc = PsNodeId::from_index(3);
        let wide = MemLoc::new(alloc, Offset::new(0), Offset::new(16));
        assert!(wide.covers(&word_at(alloc, 8)));
        assert!(!word_at(alloc, 8).covers(&wide));
        let unknown = MemLoc::new(alloc, Offset::UNKNOWN, Offset::new(8));
        assert!(!unknown.covers(&word_at(alloc, 0)));
        assert!(!wide.covers(&unknown));
    }

    /// Two stores to the same location in consecutive blocks:
    /// the strong second store kills the first.
    #[test]
    fn strong_updates_kill_prior_definitions() {
        let mut module = SliceModule::new();
        let graph = module.create_graph("main");
        let first_block = module.add_block(graph, Tid::new("blk1"));
        let second_block = module.add_block(graph, Tid::new("blk2"));
        module.connect_blocks(first_block, second_block);
        module.set_entry_block(graph, first_block);

        let first_store = module.add_node(graph, Tid::new("store1")).unwrap();
        module.push_node_to_block(first_block, first_store);
        let second_store = module.add_node(graph, Tid::new("store2")).unwrap();
        module.push_node_to_block(second_block, second_store);
        let load = module.add_node(graph, Tid::new("load")).unwrap();
        module.push_node_to_block(second_block, load);

        let alloc = PsNodeId::from_index(3);
        let mut defs: FnvHashMap<DgNodeId, Vec<DefSite>> = FnvHashMap::default();
        defs.insert(
            first_store,
            vec![DefSite {
                location: word_at(alloc, 0),
                is_strong: true,
            }],
        );
        defs.insert(
            second_store,
            vec![DefSite {
                location: word_at(alloc, 0),
                is_strong: true,
            }],
        );

        let analysis = ReachingDefsAnalysis::new(&module, graph, &defs);
        let results = analysis.run();

        let at_second_entry = results.at_block_entry(second_block).unwrap();
        assert_eq!(
            at_second_entry.get(&word_at(alloc, 0)),
            Some(&[first_store].into_iter().collect())
        );
        let at_load = analysis.reaching_at(&results, load);
        assert_eq!(
            at_load.get(&word_at(alloc, 0)),
            Some(&[second_store].into_iter().collect()),
            "the second store kills the first"
        );
    }

    /// A may-store (e.g. through an unknown offset) does not kill anything.
    #[test]
    fn weak_updates_accumulate() {
        let mut module = SliceModule::new();
        let graph = module.create_graph("main");
        let block = module.add_block(graph, Tid::new("blk"));
        module.set_entry_block(graph, block);
        let first_store = module.add_node(graph, Tid::new("store1")).unwrap();
        module.push_node_to_block(block, first_store);
        let second_store = module.add_node(graph, Tid::new("store2")).unwrap();
        module.push_node_to_block(block, second_store);
        let load = module.add_node(graph, Tid::new("load")).unwrap();
        module.push_node_to_block(block, load);

        let alloc = PsNodeId::from_index(3);
        let mut defs: FnvHashMap<DgNodeId, Vec<DefSite>> = FnvHashMap::default();
        defs.insert(
            first_store,
            vec![DefSite {
                location: word_at(alloc, 0),
                is_strong: true,
            }],
        );
        defs.insert(
            second_store,
            vec![DefSite {
                location: MemLoc::new(alloc, Offset::UNKNOWN, Offset::new(8)),
                is_strong: false,
            }],
        );

        let analysis = ReachingDefsAnalysis::new(&module, graph, &defs);
        let results = analysis.run();
        let at_load = analysis.reaching_at(&results, load);
        assert_eq!(
            at_load.get(&word_at(alloc, 0)),
            Some(&[first_store].into_iter().collect())
        );
        assert_eq!(
            at_load
                .get(&MemLoc::new(alloc, Offset::UNKNOWN, Offset::new(8)))
                .map(|nodes| nodes.len()),
            Some(1)
        );
    }

    /// Definitions from both branches of a diamond merge at the join block.
    #[test]
    fn definitions_merge_at_joins() {
        let mut module = SliceModule::new();
        let graph = module.create_graph("main");
        let head = module.add_block(graph, Tid::new("head"));
        let left = module.add_block(graph, Tid::new("left"));
        let right = module.add_block(graph, Tid::new("right"));
        let join = module.add_block(graph, Tid::new("join"));
        module.connect_blocks(head, left);
        module.connect_blocks(head, right);
        module.connect_blocks(left, join);
        module.connect_blocks(right, join);
        module.set_entry_block(graph, head);

        let left_store = module.add_node(graph, Tid::new("left_store")).unwrap();
        module.push_node_to_block(left, left_store);
        let right_store = module.add_node(graph, Tid::new("right_store")).unwrap();
        module.push_node_to_block(right, right_store);

        let alloc = PsNodeId::from_index(3);
        let mut defs: FnvHashMap<DgNodeId, Vec<DefSite>> = FnvHashMap::default();
        for store in [left_store, right_store] {
            defs.insert(
                store,
                vec![DefSite {
                    location: word_at(alloc, 0),
                    is_strong: true,
                }],
            );
        }

        let analysis = ReachingDefsAnalysis::new(&module, graph, &defs);
        let results = analysis.run();
        let at_join = results.at_block_entry(join).unwrap();
        assert_eq!(
            at_join.get(&word_at(alloc, 0)),
            Some(&[left_store, right_store].into_iter().collect())
        );
    }
}
