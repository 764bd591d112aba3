//! Adds the data-dependence edges of the dependence graphs.
//!
//! For every memory-reading node the linker resolves the read locations
//! (prepared by the frontend from the points-to results),
//! intersects them with the definitions that reach the node according to the
//! [reaching-definitions analysis](super::reaching_definitions)
//! and adds one data-dependence edge per producing definition.
//! Definitions made in other procedures are linked flow-insensitively,
//! since no intra-procedural reaching information exists for them.
//!
//! The linker also wires the call boundaries:
//! actual arguments are bound to the formal parameter-in nodes of the callee,
//! the callee's parameter-out node is bound to the call node,
//! and the callee's entry becomes control-dependent on the call.

use super::reaching_definitions::{DefSite, MemLoc, ReachingDefsAnalysis};
use crate::graph::{DgId, DgNodeId, SliceModule};
use fnv::FnvHashMap;

/// The binding of one call site to its callee,
/// recorded by the frontend while lowering the program.
#[derive(Debug, Clone)]
pub struct CallBinding {
    /// The call node.
    pub call: DgNodeId,
    /// The dependence graph of the callee.
    pub callee: DgId,
    /// The nodes defining the actual arguments, in parameter order.
    /// `None` for arguments without a defining node (e.g. literals).
    pub args: Vec<Option<DgNodeId>>,
}

/// The inputs of the def-use linker, prepared by the frontend
/// from the points-to analysis results.
#[derive(Debug, Default, Clone)]
pub struct DefUseInfo {
    /// Per node, the memory locations it may read.
    pub uses: FnvHashMap<DgNodeId, Vec<MemLoc>>,
    /// Per node, the memory locations it may (or must) write.
    pub defs: FnvHashMap<DgNodeId, Vec<DefSite>>,
    /// The call bindings of all resolved call sites.
    pub call_bindings: Vec<CallBinding>,
}

/// The def-use linker. See the module documentation.
pub struct DefUseAnalysis<'a> {
    module: &'a mut SliceModule,
    info: &'a DefUseInfo,
}

impl<'a> DefUseAnalysis<'a> {
    /// Create a new linker over the given module.
    pub fn new(module: &'a mut SliceModule, info: &'a DefUseInfo) -> DefUseAnalysis<'a> {
        DefUseAnalysis { module, info }
    }

    /// Add all data-dependence edges and call bindings.
    /// Returns the number of added edges.
    pub fn run(&mut self) -> usize {
        let mut added = 0;
        let graphs: Vec<DgId> = self.module.graph_ids().collect();
        for graph in graphs {
            added += self.link_graph(graph);
        }
        added += self.link_call_boundaries();
        added
    }

    /// Link the memory reads of one procedure to their reaching definitions.
    fn link_graph(&mut self, graph: DgId) -> usize {
        let mut planned: Vec<(DgNodeId, DgNodeId)> = Vec::new();
        {
            let module: &SliceModule = self.module;
            let analysis = ReachingDefsAnalysis::new(module, graph, &self.info.defs);
            let results = analysis.run();
            for (_, node) in module.graph(graph).nodes() {
                let Some(read_locations) = self.info.uses.get(node) else {
                    continue;
                };
                let reaching = analysis.reaching_at(&results, *node);
                for read in read_locations {
                    // intra-procedural definitions, flow-sensitively
                    for (written, defining_nodes) in &reaching {
                        if written.overlaps(read) {
                            planned
                                .extend(defining_nodes.iter().map(|defining| (*defining, *node)));
                        }
                    }
                    // definitions of other procedures (and of global
                    // declarations, which live in no block), flow-insensitively
                    for (defining, def_sites) in &self.info.defs {
                        if module.node(*defining).graph == graph
                            && module.node(*defining).block.is_some()
                        {
                            continue;
                        }
                        if def_sites
                            .iter()
                            .any(|def_site| def_site.location.overlaps(read))
                        {
                            planned.push((*defining, *node));
                        }
                    }
                }
            }
        }
        let mut added = 0;
        for (from, to) in planned {
            if from != to && self.module.add_data_edge(from, to) {
                added += 1;
            }
        }
        added
    }

    /// Bind actual and formal parameters at every resolved call site.
    fn link_call_boundaries(&mut self) -> usize {
        let mut added = 0;
        for binding in &self.info.call_bindings {
            let formals = self
                .module
                .graph(binding.callee)
                .formal_param_order()
                .to_vec();
            for (argument, formal) in binding.args.iter().zip(formals) {
                if let Some(argument) = argument {
                    if self.module.add_data_edge(*argument, formal) {
                        added += 1;
                    }
                }
            }
            if let Some(ret_param) = self.module.graph(binding.callee).ret_param() {
                if self.module.add_data_edge(ret_param, binding.call) {
                    added += 1;
                }
            }
            if let Some(entry) = self.module.graph(binding.callee).entry() {
                if self.module.add_control_edge(binding.call, entry) {
                    added += 1;
                }
            }
        }
        added
    }
}
