//! Lowers a [`Program`] to the analysis graphs and maps slice results back.
//!
//! The frontend fulfills the contract the analyses rely on:
//! it builds the [pointer subgraph](crate::pointer::subgraph)
//! with all operands wired and allocation self-pointers populated,
//! builds the [dependence graphs](crate::graph)
//! with basic blocks, formal parameters and caller sets,
//! provides the object resolver and the function-pointer callback
//! of the points-to analysis,
//! and prepares the def-use inputs from the points-to results.
//!
//! [`slice_program`] runs the whole pipeline:
//! build, points-to analysis, reaching definitions and def-use linking,
//! post-dominance, slicing, and pruning of the input program.

use crate::analysis::def_use::{CallBinding, DefUseAnalysis, DefUseInfo};
use crate::analysis::pointer_analysis::{
    Config, FlowInsensitiveContext, PointerAnalysis, PointerAnalysisContext,
};
use crate::analysis::post_dominance;
use crate::analysis::reaching_definitions::{DefSite, MemLoc};
use crate::graph::{BlockId, DgId, DgNodeId, SliceModule};
use crate::intermediate_representation::{
    Blk, CallTarget, Def, Jmp, Program, Sub, Term, Value,
};
use crate::pointer::subgraph::{
    AllocationData, PointerSubgraph, PsNodeId, PsNodeKind,
};
use crate::pointer::{Offset, Pointer};
use crate::prelude::*;
use crate::slicing::{remove_unused_graphs, Slicer};
use crate::utils::log::{AnalysisWarning, LogMessage, LogThread};
use fnv::FnvHashMap;
use itertools::Itertools;
use std::collections::BTreeSet;

#[cfg(test)]
mod tests;

/// The byte width of a stored pointer.
const WORD_SIZE: u64 = 8;

/// Everything the frontend knows about one procedure after lowering.
#[derive(Debug, Clone)]
pub struct FunctionInfo {
    /// The name of the procedure.
    pub name: String,
    /// The `FUNCTION` node of the pointer subgraph.
    pub function_node: PsNodeId,
    /// The `ENTRY` node of the pointer subgraph.
    pub entry_ps: PsNodeId,
    /// The formal parameter phi nodes, in declaration order.
    pub formals_ps: Vec<PsNodeId>,
    /// The `RETURN` nodes of the procedure.
    pub returns_ps: Vec<PsNodeId>,
    /// The dependence graph of the procedure.
    pub graph: DgId,
    /// Maps block keys to the basic blocks of the dependence graph.
    pub block_ids: FnvHashMap<Tid, BlockId>,
}

/// One lowered call site.
#[derive(Debug, Clone)]
struct CallSite {
    graph: DgId,
    dg_node: DgNodeId,
    ps_call: PsNodeId,
    call_return_ps: PsNodeId,
    args_ps: Vec<PsNodeId>,
    args_dg: Vec<Option<DgNodeId>>,
    /// The callee name for direct calls, `None` for indirect ones.
    callee_name: Option<String>,
}

/// One lowered global variable.
#[derive(Debug, Clone)]
struct GlobalInfo {
    alloc_ps: PsNodeId,
    dg_node: DgNodeId,
    size: Offset,
}

/// A memory access relevant for the def-use linker.
#[derive(Debug, Clone)]
enum MemoryOp {
    Load {
        dg_node: DgNodeId,
        address: PsNodeId,
    },
    Store {
        dg_node: DgNodeId,
        address: PsNodeId,
    },
    Memcpy {
        dg_node: DgNodeId,
        source: PsNodeId,
        destination: PsNodeId,
        length: Offset,
    },
}

/// The analysis graphs of a program together with the lowering maps.
pub struct LoweredProgram {
    /// The pointer subgraph of the program.
    pub subgraph: PointerSubgraph,
    /// The dependence graphs of all procedures.
    pub module: SliceModule,
    /// The worklist seeds of the points-to analysis.
    pub roots: Vec<PsNodeId>,
    functions: FnvHashMap<String, FunctionInfo>,
    call_sites: Vec<CallSite>,
    globals: FnvHashMap<Tid, GlobalInfo>,
    memory_ops: Vec<MemoryOp>,
    call_bindings: Vec<CallBinding>,
    entry_name: String,
}

/// The lowering of one procedure body. Only used during the build.
struct SubLowering {
    tid_to_ps: FnvHashMap<Tid, PsNodeId>,
    returns: Vec<PsNodeId>,
    /// The first and last pointer subgraph node of every block.
    block_spans: FnvHashMap<Tid, (PsNodeId, PsNodeId)>,
}

impl LoweredProgram {
    /// Lower a program to its pointer subgraph and dependence graphs.
    pub fn build(program: &Program) -> Result<LoweredProgram, Error> {
        if program.entry_sub().is_none() {
            return Err(anyhow!(
                "The program has no entry procedure named {}",
                program.entry
            ));
        }
        if let Some(duplicate) = program
            .subs
            .iter()
            .map(|sub| &sub.term.name)
            .duplicates()
            .next()
        {
            return Err(anyhow!("Duplicate procedure name {duplicate}"));
        }
        let mut builder = Builder {
            program,
            subgraph: PointerSubgraph::new(),
            module: SliceModule::new(),
            functions: FnvHashMap::default(),
            call_sites: Vec::new(),
            globals: FnvHashMap::default(),
            memory_ops: Vec::new(),
            null_constant: None,
            opaque_value: None,
        };
        builder.create_function_skeletons();
        builder.create_globals()?;
        for sub in &program.subs {
            builder.lower_sub_body(sub)?;
        }
        builder.bind_direct_calls();
        let roots = builder.collect_roots();
        let call_bindings = builder.direct_call_bindings();
        Ok(LoweredProgram {
            subgraph: builder.subgraph,
            module: builder.module,
            roots,
            functions: builder.functions,
            call_sites: builder.call_sites,
            globals: builder.globals,
            memory_ops: builder.memory_ops,
            call_bindings,
            entry_name: program.entry.clone(),
        })
    }

    /// The lowered information about a procedure.
    pub fn function(&self, name: &str) -> Option<&FunctionInfo> {
        self.functions.get(name)
    }

    /// Create the points-to analysis backend for this program.
    pub fn pta_context(&self) -> FrontendPtaContext {
        FrontendPtaContext {
            functions: self.functions.clone(),
            call_returns: self
                .call_sites
                .iter()
                .map(|site| (site.ps_call, site.call_return_ps))
                .collect(),
            call_args: self
                .call_sites
                .iter()
                .map(|site| (site.ps_call, site.args_ps.clone()))
                .collect(),
        }
    }

    /// Attach the callees discovered by the points-to analysis
    /// to the dependence graphs of the indirect call sites.
    pub fn resolve_indirect_calls(&mut self) {
        let mut new_bindings = Vec::new();
        for site in self.call_sites.iter().filter(|site| site.callee_name.is_none()) {
            let targets: Vec<String> = self
                .subgraph
                .node(site.ps_call)
                .points_to
                .iter()
                .filter(|pointer| pointer.is_valid() && !pointer.is_invalidated())
                .filter_map(|pointer| match &self.subgraph.node(pointer.target).kind {
                    PsNodeKind::Function { name } => Some(name.clone()),
                    _ => None,
                })
                .collect();
            for name in targets {
                if let Some(info) = self.functions.get(&name) {
                    new_bindings.push(CallBinding {
                        call: site.dg_node,
                        callee: info.graph,
                        args: site.args_dg.clone(),
                    });
                }
            }
        }
        for binding in &new_bindings {
            self.module.set_callee(binding.call, binding.callee);
        }
        self.call_bindings.extend(new_bindings);
    }

    /// Build the inputs of the def-use linker from the points-to results.
    pub fn def_use_info(&self) -> DefUseInfo {
        let mut info = DefUseInfo {
            call_bindings: self.call_bindings.clone(),
            ..DefUseInfo::default()
        };
        for global in self.globals.values() {
            // the declaration (with initializer or zero fill) defines the whole range
            info.defs.entry(global.dg_node).or_default().push(DefSite {
                location: MemLoc::new(global.alloc_ps, Offset::new(0), global.size),
                is_strong: false,
            });
        }
        for op in &self.memory_ops {
            match op {
                MemoryOp::Load { dg_node, address } => {
                    let reads = self.pointed_locations(*address, Offset::new(WORD_SIZE));
                    if !reads.is_empty() {
                        info.uses.entry(*dg_node).or_default().extend(reads);
                    }
                }
                MemoryOp::Store { dg_node, address } => {
                    let address_set = &self.subgraph.node(*address).points_to;
                    let is_strong = match address_set.get_if_singleton() {
                        Some(pointer) => {
                            pointer.is_valid()
                                && !pointer.is_invalidated()
                                && !pointer.offset.is_unknown()
                                && !self.subgraph.node(pointer.target).is_heap()
                        }
                        None => false,
                    };
                    for location in self.pointed_locations(*address, Offset::new(WORD_SIZE)) {
                        info.defs.entry(*dg_node).or_default().push(DefSite {
                            location,
                            is_strong,
                        });
                    }
                }
                MemoryOp::Memcpy {
                    dg_node,
                    source,
                    destination,
                    length,
                } => {
                    let reads = self.pointed_locations(*source, *length);
                    if !reads.is_empty() {
                        info.uses.entry(*dg_node).or_default().extend(reads);
                    }
                    for location in self.pointed_locations(*destination, *length) {
                        info.defs.entry(*dg_node).or_default().push(DefSite {
                            location,
                            is_strong: false,
                        });
                    }
                }
            }
        }
        info
    }

    /// The memory locations a pointer value may refer to.
    fn pointed_locations(&self, value: PsNodeId, length: Offset) -> Vec<MemLoc> {
        self.subgraph
            .node(value)
            .points_to
            .iter()
            .filter(|pointer| pointer.is_valid() && !pointer.is_invalidated())
            .filter(|pointer| self.subgraph.node(pointer.target).is_allocation())
            .map(|pointer| MemLoc::new(pointer.target, pointer.offset, length))
            .collect()
    }

    /// The call sites whose callee has the given name.
    /// Both direct calls and resolved indirect calls are searched.
    pub fn criterion_nodes(&self, criterion: &str) -> Vec<DgNodeId> {
        let mut nodes: Vec<DgNodeId> = self
            .call_sites
            .iter()
            .filter(|site| site.callee_name.as_deref() == Some(criterion))
            .map(|site| site.dg_node)
            .collect();
        if let Some(info) = self.functions.get(criterion) {
            nodes.extend(
                self.call_bindings
                    .iter()
                    .filter(|binding| binding.callee == info.graph)
                    .map(|binding| binding.call),
            );
        }
        nodes.into_iter().unique().collect()
    }

    /// The exit node of the entry procedure,
    /// used when the criterion is the special name `ret`.
    pub fn exit_criterion(&self) -> Option<DgNodeId> {
        let info = self.functions.get(&self.entry_name)?;
        self.module.graph(info.graph).exit()
    }

    /// Map the slice results back to a pruned program.
    ///
    /// Instructions whose dependence graph node was removed are dropped,
    /// as are emptied blocks, unused procedures and unused globals.
    /// Jumps to removed blocks are redirected along the stitched control flow.
    pub fn prune_program(&self, program: &Program) -> Program {
        let mut subs = Vec::new();
        for sub in &program.subs {
            let Some(info) = self.functions.get(&sub.term.name) else {
                continue;
            };
            if !self.module.graph(info.graph).is_alive() {
                continue;
            }
            subs.push(Term {
                tid: sub.tid.clone(),
                term: self.prune_sub(&sub.term, info),
            });
        }
        let globals = program
            .globals
            .iter()
            .filter(|global| {
                let Some(info) = self.globals.get(&global.tid) else {
                    return false;
                };
                self.module.node(info.dg_node).is_alive()
            })
            .cloned()
            .collect();
        Program {
            globals,
            subs,
            entry: program.entry.clone(),
        }
    }

    fn prune_sub(&self, sub: &Sub, info: &FunctionInfo) -> Sub {
        let mut blocks = Vec::new();
        for block in &sub.blocks {
            let Some(block_id) = info.block_ids.get(&block.tid) else {
                continue;
            };
            if !self.module.block(*block_id).is_alive() {
                continue;
            }
            let defs = block
                .term
                .defs
                .iter()
                .filter(|def| self.module.get_node(info.graph, &def.tid).is_some())
                .cloned()
                .collect();
            let jmp = Term {
                tid: block.term.jmp.tid.clone(),
                term: self.retarget_jmp(&block.term.jmp.term, info),
            };
            blocks.push(Term {
                tid: block.tid.clone(),
                term: Blk { defs, jmp },
            });
        }
        Sub {
            name: sub.name.clone(),
            parameters: sub.parameters.clone(),
            blocks,
        }
    }

    /// Redirect a jump along the stitched control flow graph.
    fn retarget_jmp(&self, jmp: &Jmp, info: &FunctionInfo) -> Jmp {
        let resolve = |target: &Tid| -> Option<Tid> {
            let block = info.block_ids.get(target)?;
            let survivor = self.module.surviving_block(*block)?;
            Some(self.module.block(survivor).key.clone())
        };
        match jmp {
            Jmp::Branch(target) => match resolve(target) {
                Some(target) => Jmp::Branch(target),
                None => Jmp::Return(None),
            },
            Jmp::CondBranch {
                condition,
                if_true,
                if_false,
            } => match (resolve(if_true), resolve(if_false)) {
                (Some(if_true), Some(if_false)) if if_true != if_false => Jmp::CondBranch {
                    condition: condition.clone(),
                    if_true,
                    if_false,
                },
                (Some(target), _) | (None, Some(target)) => Jmp::Branch(target),
                (None, None) => Jmp::Return(None),
            },
            Jmp::Return(value) => Jmp::Return(value.clone()),
        }
    }
}

/// The state of the lowering. Dropped once the `LoweredProgram` is built.
struct Builder<'a> {
    program: &'a Program,
    subgraph: PointerSubgraph,
    module: SliceModule,
    functions: FnvHashMap<String, FunctionInfo>,
    call_sites: Vec<CallSite>,
    globals: FnvHashMap<Tid, GlobalInfo>,
    memory_ops: Vec<MemoryOp>,
    /// The shared `CONSTANT` node holding the null pointer.
    null_constant: Option<PsNodeId>,
    /// The shared node standing in for non-pointer values.
    opaque_value: Option<PsNodeId>,
}

impl<'a> Builder<'a> {
    /// First pass: one graph, `FUNCTION` and `ENTRY` node
    /// and the formal parameters per procedure.
    fn create_function_skeletons(&mut self) {
        for sub in &self.program.subs {
            let name = sub.term.name.clone();
            let graph = self.module.create_graph(name.clone());
            let function_node = self.subgraph.add_node(PsNodeKind::Function {
                name: name.clone(),
            });
            let entry_ps = self.subgraph.add_node(PsNodeKind::Entry);
            self.subgraph.node_mut(entry_ps).parent = Some(entry_ps);

            let mut formals_ps = Vec::new();
            for parameter in &sub.term.parameters {
                let phi = self.subgraph.add_node(PsNodeKind::Phi);
                self.subgraph.node_mut(phi).parent = Some(entry_ps);
                formals_ps.push(phi);
                self.module.add_formal_param(graph, parameter.tid.clone());
            }
            self.module
                .set_ret_param(graph, sub.tid.clone().with_id_suffix("_ret"));

            self.functions.insert(
                name.clone(),
                FunctionInfo {
                    name,
                    function_node,
                    entry_ps,
                    formals_ps,
                    returns_ps: Vec::new(),
                    graph,
                    block_ids: FnvHashMap::default(),
                },
            );
        }
    }

    /// Create the allocation and dependence nodes of the global variables.
    /// The entry procedure's graph owns the shared global-nodes table.
    fn create_globals(&mut self) -> Result<(), Error> {
        let entry_graph = self.functions[&self.program.entry].graph;
        for global in &self.program.globals {
            let size = global
                .term
                .size
                .map(Offset::new)
                .unwrap_or(Offset::UNKNOWN);
            let alloc_ps = self.subgraph.add_node(PsNodeKind::Alloc(AllocationData {
                size,
                zero_initialized: global.term.zero_initialized,
                is_heap: false,
                is_global: true,
            }));
            self.subgraph.node_mut(alloc_ps).tid = Some(global.tid.clone());
            let dg_node = self
                .module
                .add_global_node(entry_graph, global.tid.clone())
                .ok_or_else(|| anyhow!("Duplicate global variable {}", global.tid))?;
            self.globals.insert(
                global.tid.clone(),
                GlobalInfo {
                    alloc_ps,
                    dg_node,
                    size,
                },
            );
        }
        // every other graph sees the same table
        let graphs: Vec<DgId> = self
            .functions
            .values()
            .map(|info| info.graph)
            .filter(|graph| *graph != entry_graph)
            .collect();
        for graph in graphs {
            self.module.share_global_nodes(entry_graph, graph);
        }
        Ok(())
    }

    /// Second pass: lower the blocks of one procedure.
    fn lower_sub_body(&mut self, sub: &Term<Sub>) -> Result<(), Error> {
        let info = self.functions[&sub.term.name].clone();
        let graph = info.graph;
        let mut lowering = SubLowering {
            tid_to_ps: FnvHashMap::default(),
            returns: Vec::new(),
            block_spans: FnvHashMap::default(),
        };
        for (parameter, phi) in sub.term.parameters.iter().zip(&info.formals_ps) {
            lowering.tid_to_ps.insert(parameter.tid.clone(), *phi);
        }

        // dependence graph skeleton: entry and exit node, one block per IR block
        let entry_node = self
            .module
            .add_node(graph, sub.tid.clone().with_id_suffix("_entry"))
            .ok_or_else(|| anyhow!("Duplicate entry node in {}", sub.term.name))?;
        self.module.set_entry(graph, entry_node);
        let exit_node = self
            .module
            .add_node(graph, sub.tid.clone().with_id_suffix("_exit"))
            .ok_or_else(|| anyhow!("Duplicate exit node in {}", sub.term.name))?;
        self.module.set_exit(graph, exit_node);

        let mut block_ids = FnvHashMap::default();
        for block in &sub.term.blocks {
            let block_id = self.module.add_block(graph, block.tid.clone());
            block_ids.insert(block.tid.clone(), block_id);
        }
        let exit_block = self
            .module
            .add_block(graph, sub.tid.clone().with_id_suffix("_exit_blk"));
        self.module.push_node_to_block(exit_block, exit_node);
        self.module.set_exit_block(graph, exit_block);

        for (index, block) in sub.term.blocks.iter().enumerate() {
            let block_id = block_ids[&block.tid];
            if index == 0 {
                self.module.set_entry_block(graph, block_id);
                self.module.push_node_to_block(block_id, entry_node);
            }
            self.lower_block(sub, block, &info, block_id, &mut lowering)?;
            match &block.term.jmp.term {
                Jmp::Return(_) => self.module.connect_blocks(block_id, exit_block),
                jmp => {
                    for target in jmp.targets() {
                        let target_block = block_ids.get(target).ok_or_else(|| {
                            anyhow!("Jump {} to an unknown block {target}", block.term.jmp.tid)
                        })?;
                        self.module.connect_blocks(block_id, *target_block);
                    }
                }
            }
        }

        // wire the pointer subgraph across the block boundaries
        if let Some(first_block) = sub.term.blocks.first() {
            if let Some((first_ps, _)) = lowering.block_spans.get(&first_block.tid) {
                self.subgraph.add_successor(info.entry_ps, *first_ps);
            }
        }
        for block in &sub.term.blocks {
            let (_, last_ps) = lowering.block_spans[&block.tid];
            for target in block.term.jmp.term.targets() {
                if let Some((target_first, _)) = lowering.block_spans.get(target) {
                    self.subgraph.add_successor(last_ps, *target_first);
                }
            }
        }

        let function = self.functions.get_mut(&sub.term.name).unwrap();
        function.returns_ps = lowering.returns;
        function.block_ids = block_ids;
        Ok(())
    }

    /// Lower the instructions and the jump of one block.
    fn lower_block(
        &mut self,
        sub: &Term<Sub>,
        block: &Term<Blk>,
        info: &FunctionInfo,
        block_id: BlockId,
        lowering: &mut SubLowering,
    ) -> Result<(), Error> {
        let graph = info.graph;
        let mut block_chain: Vec<PsNodeId> = Vec::new();
        for def in &block.term.defs {
            let dg_node = self
                .module
                .add_node(graph, def.tid.clone())
                .ok_or_else(|| anyhow!("Duplicate instruction {}", def.tid))?;
            self.module.push_node_to_block(block_id, dg_node);
            for operand in def.term.operands() {
                if let Some(defining) = self.dg_value(graph, operand) {
                    self.module.add_use_edge(defining, dg_node);
                }
            }
            let result_ps =
                self.lower_def(def, info, graph, dg_node, lowering, &mut block_chain)?;
            self.subgraph.node_mut(result_ps).tid = Some(def.tid.clone());
            lowering.tid_to_ps.insert(def.tid.clone(), result_ps);
        }

        // the jump terminates the block
        let jmp_node = self
            .module
            .add_node(graph, block.term.jmp.tid.clone())
            .ok_or_else(|| anyhow!("Duplicate jump {}", block.term.jmp.tid))?;
        self.module.push_node_to_block(block_id, jmp_node);
        let jmp_ps = match &block.term.jmp.term {
            Jmp::Return(value) => {
                let return_ps = self.subgraph.add_node(PsNodeKind::Return);
                if let Some(value) = value {
                    let value_ps = self.ps_value(value, lowering);
                    self.subgraph.add_operand(return_ps, value_ps);
                    if let Some(defining) = self.dg_value(graph, value) {
                        self.module.add_use_edge(defining, jmp_node);
                        let ret_param = self.module.graph(graph).ret_param().unwrap();
                        self.module.add_data_edge(defining, ret_param);
                    }
                }
                lowering.returns.push(return_ps);
                return_ps
            }
            Jmp::CondBranch { condition, .. } => {
                if let Some(defining) = self.dg_value(graph, condition) {
                    self.module.add_use_edge(defining, jmp_node);
                }
                self.subgraph.add_node(PsNodeKind::Noop)
            }
            Jmp::Branch(_) => self.subgraph.add_node(PsNodeKind::Noop),
        };
        if let Some(exit) = self.module.graph(graph).exit() {
            if matches!(block.term.jmp.term, Jmp::Return(_)) {
                self.module.add_use_edge(jmp_node, exit);
            }
        }
        self.subgraph.node_mut(jmp_ps).tid = Some(block.term.jmp.tid.clone());
        block_chain.push(jmp_ps);

        for node in &block_chain {
            self.subgraph.node_mut(*node).parent = Some(info.entry_ps);
        }
        for window in block_chain.windows(2) {
            // calls already have their callee as successor, keep the
            // fall-through edge next to it
            self.subgraph.add_successor(window[0], window[1]);
        }
        lowering.block_spans.insert(
            block.tid.clone(),
            (block_chain[0], *block_chain.last().unwrap()),
        );
        Ok(())
    }

    /// Lower one instruction to its pointer subgraph nodes.
    /// Returns the node holding the instruction's result value.
    fn lower_def(
        &mut self,
        def: &Term<Def>,
        info: &FunctionInfo,
        graph: DgId,
        dg_node: DgNodeId,
        lowering: &mut SubLowering,
        block_chain: &mut Vec<PsNodeId>,
    ) -> Result<PsNodeId, Error> {
        let result = match &def.term {
            Def::Alloc {
                size,
                zero_initialized,
            }
            | Def::DynAlloc {
                size,
                zero_initialized,
            } => {
                let data = AllocationData {
                    size: size.map(Offset::new).unwrap_or(Offset::UNKNOWN),
                    zero_initialized: *zero_initialized,
                    is_heap: matches!(def.term, Def::DynAlloc { .. }),
                    is_global: false,
                };
                let kind = if matches!(def.term, Def::DynAlloc { .. }) {
                    PsNodeKind::DynAlloc(data)
                } else {
                    PsNodeKind::Alloc(data)
                };
                let node = self.subgraph.add_node(kind);
                block_chain.push(node);
                node
            }
            Def::Load { address } => {
                let address_ps = self.ps_value(address, lowering);
                let node = self.subgraph.add_node(PsNodeKind::Load);
                self.subgraph.add_operand(node, address_ps);
                block_chain.push(node);
                self.memory_ops.push(MemoryOp::Load {
                    dg_node,
                    address: address_ps,
                });
                node
            }
            Def::Store { address, value } => {
                let address_ps = self.ps_value(address, lowering);
                let value_ps = self.ps_value(value, lowering);
                let node = self.subgraph.add_node(PsNodeKind::Store);
                self.subgraph.add_operand(node, value_ps);
                self.subgraph.add_operand(node, address_ps);
                block_chain.push(node);
                self.memory_ops.push(MemoryOp::Store {
                    dg_node,
                    address: address_ps,
                });
                node
            }
            Def::Gep { base, offset } => {
                let base_ps = self.ps_value(base, lowering);
                let node = self.subgraph.add_node(PsNodeKind::Gep {
                    offset: Offset::new(*offset),
                });
                self.subgraph.add_operand(node, base_ps);
                block_chain.push(node);
                node
            }
            Def::Cast { value } => {
                let value_ps = self.ps_value(value, lowering);
                let node = self.subgraph.add_node(PsNodeKind::Cast);
                self.subgraph.add_operand(node, value_ps);
                block_chain.push(node);
                node
            }
            Def::Phi { values } => {
                let node = self.subgraph.add_node(PsNodeKind::Phi);
                for value in values {
                    let value_ps = self.ps_value(value, lowering);
                    self.subgraph.add_operand(node, value_ps);
                }
                block_chain.push(node);
                node
            }
            Def::Call { target, args } => {
                self.lower_call(def, target, args, info, graph, dg_node, lowering, block_chain)
            }
            Def::Memcpy {
                destination,
                source,
                length,
            } => {
                let source_ps = self.ps_value(source, lowering);
                let destination_ps = self.ps_value(destination, lowering);
                let length = length.map(Offset::new).unwrap_or(Offset::UNKNOWN);
                let node = self.subgraph.add_node(PsNodeKind::Memcpy { length });
                self.subgraph.add_operand(node, source_ps);
                self.subgraph.add_operand(node, destination_ps);
                block_chain.push(node);
                self.memory_ops.push(MemoryOp::Memcpy {
                    dg_node,
                    source: source_ps,
                    destination: destination_ps,
                    length,
                });
                node
            }
            Def::Free { pointer } => {
                let pointer_ps = self.ps_value(pointer, lowering);
                let node = self.subgraph.add_node(PsNodeKind::Free);
                self.subgraph.add_operand(node, pointer_ps);
                block_chain.push(node);
                node
            }
            Def::Compute { .. } => {
                let node = self.subgraph.add_node(PsNodeKind::Noop);
                block_chain.push(node);
                node
            }
        };
        Ok(result)
    }

    /// Lower a call instruction: the call node, its value node
    /// and the call site record used for the later binding.
    #[allow(clippy::too_many_arguments)]
    fn lower_call(
        &mut self,
        def: &Term<Def>,
        target: &CallTarget,
        args: &[Value],
        _info: &FunctionInfo,
        graph: DgId,
        dg_node: DgNodeId,
        lowering: &mut SubLowering,
        block_chain: &mut Vec<PsNodeId>,
    ) -> PsNodeId {
        let (call_ps, callee_name) = match target {
            CallTarget::Direct(name) => {
                (self.subgraph.add_node(PsNodeKind::Call), Some(name.clone()))
            }
            CallTarget::Indirect(value) => {
                let target_ps = self.ps_value(value, lowering);
                let node = self.subgraph.add_node(PsNodeKind::CallFuncPtr);
                self.subgraph.add_operand(node, target_ps);
                (node, None)
            }
        };
        self.subgraph.node_mut(call_ps).tid = Some(def.tid.clone());
        let call_return_ps = self.subgraph.add_node(PsNodeKind::CallReturn);
        block_chain.push(call_ps);
        block_chain.push(call_return_ps);

        let args_ps: Vec<PsNodeId> = args
            .iter()
            .map(|value| self.ps_value(value, lowering))
            .collect();
        let args_dg: Vec<Option<DgNodeId>> = args
            .iter()
            .map(|value| self.dg_value(graph, value))
            .collect();
        self.call_sites.push(CallSite {
            graph,
            dg_node,
            ps_call: call_ps,
            call_return_ps,
            args_ps,
            args_dg,
            callee_name,
        });
        call_return_ps
    }

    /// Third pass: wire the direct call sites to their callees,
    /// in the pointer subgraph and in the dependence graphs.
    fn bind_direct_calls(&mut self) {
        for site in &self.call_sites {
            let Some(name) = &site.callee_name else {
                continue;
            };
            let Some(callee) = self.functions.get(name) else {
                // calls to procedures outside the program stay unresolved
                continue;
            };
            for (formal, actual) in callee.formals_ps.iter().zip(&site.args_ps) {
                self.subgraph.add_operand(*formal, *actual);
            }
            for return_ps in &callee.returns_ps {
                self.subgraph.add_operand(site.call_return_ps, *return_ps);
                self.subgraph.add_successor(*return_ps, site.call_return_ps);
            }
            self.subgraph.add_successor(site.ps_call, callee.entry_ps);
            self.module.set_callee(site.dg_node, callee.graph);
        }
    }

    /// The dependence-graph bindings of all direct call sites.
    fn direct_call_bindings(&self) -> Vec<CallBinding> {
        self.call_sites
            .iter()
            .filter_map(|site| {
                let name = site.callee_name.as_ref()?;
                let callee = self.functions.get(name)?;
                Some(CallBinding {
                    call: site.dg_node,
                    callee: callee.graph,
                    args: site.args_dg.clone(),
                })
            })
            .collect()
    }

    /// The worklist seeds: the global initializer chain
    /// followed by the entry nodes of all procedures.
    fn collect_roots(&mut self) -> Vec<PsNodeId> {
        let mut roots = Vec::new();
        let mut init_chain: Vec<PsNodeId> = Vec::new();
        for global in &self.program.globals {
            let Some(initializer) = &global.term.initializer else {
                continue;
            };
            let global_alloc = self.globals[&global.tid].alloc_ps;
            let global_dg = self.globals[&global.tid].dg_node;
            let value_ps = match initializer {
                Value::Ref(tid) => self.globals.get(tid).map(|info| info.alloc_ps),
                Value::Function(name) => {
                    self.functions.get(name).map(|info| info.function_node)
                }
                Value::NullPtr => Some(self.null_constant()),
                Value::Int(_) => None,
            };
            let Some(value_ps) = value_ps else {
                continue;
            };
            let store = self.subgraph.add_node(PsNodeKind::Store);
            self.subgraph.add_operand(store, value_ps);
            self.subgraph.add_operand(store, global_alloc);
            self.subgraph.node_mut(store).tid = Some(global.tid.clone());
            init_chain.push(store);
            self.memory_ops.push(MemoryOp::Store {
                dg_node: global_dg,
                address: global_alloc,
            });
        }
        for window in init_chain.windows(2) {
            self.subgraph.add_successor(window[0], window[1]);
        }
        if let (Some(last), Some(entry)) =
            (init_chain.last(), self.functions.get(&self.program.entry))
        {
            self.subgraph.add_successor(*last, entry.entry_ps);
        }
        roots.extend(init_chain.first());
        for info in self.functions.values() {
            roots.push(info.entry_ps);
        }
        roots
    }

    /// The pointer subgraph node holding the given value.
    fn ps_value(&mut self, value: &Value, lowering: &SubLowering) -> PsNodeId {
        match value {
            Value::Ref(tid) => {
                if let Some(node) = lowering.tid_to_ps.get(tid) {
                    return *node;
                }
                if let Some(global) = self.globals.get(tid) {
                    return global.alloc_ps;
                }
                // a forward reference inside a loop; treated as opaque
                self.opaque_value()
            }
            Value::Function(name) => match self.functions.get(name) {
                Some(info) => info.function_node,
                None => self.opaque_value(),
            },
            Value::NullPtr => self.null_constant(),
            Value::Int(_) => self.opaque_value(),
        }
    }

    /// The dependence node defining the given value, if there is one.
    fn dg_value(&self, graph: DgId, value: &Value) -> Option<DgNodeId> {
        match value {
            Value::Ref(tid) => self.module.get_node(graph, tid),
            _ => None,
        }
    }

    fn null_constant(&mut self) -> PsNodeId {
        if let Some(node) = self.null_constant {
            return node;
        }
        let node = self.subgraph.add_node(PsNodeKind::Constant);
        self.subgraph.add_pointer(node, Pointer::null());
        self.null_constant = Some(node);
        node
    }

    fn opaque_value(&mut self) -> PsNodeId {
        if let Some(node) = self.opaque_value {
            return node;
        }
        let node = self.subgraph.add_node(PsNodeKind::Noop);
        self.opaque_value = Some(node);
        node
    }
}

/// The points-to backend of the frontend:
/// a flow-insensitive object resolver
/// plus the callback splicing in newly discovered callees of indirect calls.
pub struct FrontendPtaContext {
    functions: FnvHashMap<String, FunctionInfo>,
    call_returns: FnvHashMap<PsNodeId, PsNodeId>,
    call_args: FnvHashMap<PsNodeId, Vec<PsNodeId>>,
}

impl PointerAnalysisContext for FrontendPtaContext {
    fn resolve_objects(
        &self,
        subgraph: &PointerSubgraph,
        node: PsNodeId,
        pointer: &Pointer,
    ) -> Result<Vec<PsNodeId>, Error> {
        FlowInsensitiveContext.resolve_objects(subgraph, node, pointer)
    }

    fn function_pointer_call(
        &mut self,
        subgraph: &mut PointerSubgraph,
        call: PsNodeId,
        function: PsNodeId,
    ) -> Result<Vec<PsNodeId>, Error> {
        let PsNodeKind::Function { name } = &subgraph.node(function).kind else {
            return Err(anyhow!("Called pointer target {function} is not a function"));
        };
        let Some(info) = self.functions.get(name) else {
            // a pointer to a procedure outside the program
            return Ok(Vec::new());
        };
        let mut to_enqueue = vec![info.entry_ps];
        if let Some(args) = self.call_args.get(&call) {
            for (formal, actual) in info.formals_ps.iter().zip(args) {
                subgraph.add_operand(*formal, *actual);
                to_enqueue.push(*formal);
            }
        }
        if let Some(call_return) = self.call_returns.get(&call) {
            for return_ps in &info.returns_ps {
                subgraph.add_operand(*call_return, *return_ps);
                subgraph.add_successor(*return_ps, *call_return);
            }
            to_enqueue.push(*call_return);
        }
        subgraph.add_successor(call, info.entry_ps);
        Ok(to_enqueue)
    }
}

/// The results of a full slicing run.
pub struct SlicingResults {
    /// The pruned program.
    pub program: Program,
    /// `(total, removed)` node counts of the slicing step.
    pub statistics: (u64, u64),
    /// The names of the procedures removed as unused.
    pub removed_functions: Vec<String>,
    /// Log messages of the whole pipeline.
    pub logs: Vec<LogMessage>,
    /// Analysis warnings of the whole pipeline.
    pub warnings: Vec<AnalysisWarning>,
}

/// Run the complete pipeline on a program:
/// lower it, run the points-to analysis,
/// link the dependence edges, compute control dependences,
/// slice with respect to the criterion and prune the program.
///
/// The criterion names a called procedure;
/// the special name `ret` slices with respect to
/// the exit of the entry procedure.
/// Procedures in `untouched` are never pruned.
pub fn slice_program(
    program: &Program,
    criterion: &str,
    config: Config,
    untouched: &[String],
) -> Result<SlicingResults, Error> {
    let log_thread = LogThread::spawn(LogThread::collect_and_deduplicate);
    let mut lowered = LoweredProgram::build(program)?;

    let context = lowered.pta_context();
    let mut pta = PointerAnalysis::new(
        &mut lowered.subgraph,
        context,
        config,
        log_thread.get_msg_sender(),
    );
    let roots = lowered.roots.clone();
    pta.run(&roots)?;
    let change_count = pta.change_count();
    drop(pta);

    lowered.resolve_indirect_calls();
    let info = lowered.def_use_info();
    let added_data_edges = DefUseAnalysis::new(&mut lowered.module, &info).run();
    let graphs: Vec<DgId> = lowered.module.graph_ids().collect();
    for graph in graphs {
        post_dominance::compute_post_dominators(&mut lowered.module, graph, true);
        post_dominance::add_control_dependence_edges(&mut lowered.module, graph);
    }

    // the criterion may only have become callable through the points-to results
    let mut criteria = lowered.criterion_nodes(criterion);
    if criteria.is_empty() {
        if criterion == "ret" {
            criteria.extend(lowered.exit_criterion());
        } else {
            return Err(anyhow!("Did not find the slicing criterion: {criterion}"));
        }
    }
    if criteria.is_empty() {
        return Err(anyhow!("Did not find the slicing criterion: {criterion}"));
    }

    let mut slicer = Slicer::new();
    for name in untouched {
        slicer.keep_function_untouched(name);
    }
    let mut slice_id = 0;
    for criterion_node in criteria {
        slice_id = slicer.mark(&mut lowered.module, criterion_node, slice_id);
    }
    slicer.slice(&mut lowered.module, slice_id);

    let mut keep: BTreeSet<String> = untouched.iter().cloned().collect();
    keep.insert(program.entry.clone());
    let removed_functions = remove_unused_graphs(&mut lowered.module, &keep);

    let pruned = lowered.prune_program(program);
    let (mut logs, warnings) = log_thread.collect();
    let (total, removed) = slicer.get_statistics();
    logs.push(
        LogMessage::new_info(format!(
            "Points-to analysis stabilized after {change_count} changes"
        ))
        .source("Pointer Analysis"),
    );
    logs.push(
        LogMessage::new_info(format!("Added {added_data_edges} dependence edges"))
            .source("Def-Use"),
    );
    logs.push(
        LogMessage::new_info(format!("Sliced away {removed} from {total} nodes")).source("Slicer"),
    );
    Ok(SlicingResults {
        program: pruned,
        statistics: (total, removed),
        removed_functions,
        logs,
        warnings,
    })
}
