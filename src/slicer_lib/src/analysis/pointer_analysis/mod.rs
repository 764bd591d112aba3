//! A worklist algorithm computing the points-to sets of a pointer subgraph.
//!
//! The analysis is inclusion-based, field-sensitive
//! (memory objects are maps from byte offsets to pointer sets)
//! and flow-sensitive in the sense that nodes are only processed
//! along the successor relation of the subgraph.
//!
//! The engine itself is independent of the memory backend:
//! a [`PointerAnalysisContext`] supplies the *object resolver*
//! that maps a pointer used at a program point to the live memory objects
//! it may refer to,
//! and the *function-pointer callback* that is invoked
//! whenever a new callee of an indirect call is discovered.
//! The callback may splice new subgraph parts in;
//! the nodes it returns are re-enqueued.
//! The [`FlowInsensitiveContext`] is the default backend
//! resolving each pointer to the single object of its target allocation.
//!
//! Recoverable findings (see [`WarningKind`](crate::utils::log::WarningKind))
//! are sent to the log sink and do not stop the fixpoint iteration.
//! Violated engine invariants and unresolvable memcpy operands are fatal
//! and abort the analysis with an error.

use crate::pointer::subgraph::{PointerSubgraph, PsNodeId, PsNodeKind, INVALIDATED};
use crate::pointer::{MemoryObject, Offset, Pointer};
use crate::prelude::*;
use crate::utils::log::{AnalysisWarning, LogThreadMsg, WarningKind};
use fnv::{FnvHashMap, FnvHashSet};
use std::collections::BTreeSet;
use std::collections::VecDeque;

#[cfg(test)]
mod tests;

/// Configurable parameters of the analysis.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone)]
pub struct Config {
    /// The saturation ceiling for field-sensitivity:
    /// pointer offsets at or above this value are widened to the unknown offset.
    pub max_offset: u64,
    /// When true, pointers to local allocations of returned-from procedures
    /// are marked as invalidated at call-return nodes.
    pub invalidate_nodes: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            max_offset: 64,
            invalidate_nodes: false,
        }
    }
}

/// The backend of a points-to analysis.
///
/// See the module documentation for the role of the two methods.
pub trait PointerAnalysisContext {
    /// Map a pointer used at the given node
    /// to the keys of the memory objects it may refer to.
    ///
    /// Returns an error if the pointer's target cannot hold memory objects,
    /// which indicates a broken subgraph.
    fn resolve_objects(
        &self,
        subgraph: &PointerSubgraph,
        node: PsNodeId,
        pointer: &Pointer,
    ) -> Result<Vec<PsNodeId>, Error>;

    /// Called when `call` may newly call `function`.
    /// May splice new nodes into the subgraph;
    /// all returned nodes get enqueued.
    fn function_pointer_call(
        &mut self,
        subgraph: &mut PointerSubgraph,
        call: PsNodeId,
        function: PsNodeId,
    ) -> Result<Vec<PsNodeId>, Error>;
}

/// The default backend: every pointer resolves to the unique memory object
/// of its target allocation and newly discovered callees are ignored.
pub struct FlowInsensitiveContext;

impl PointerAnalysisContext for FlowInsensitiveContext {
    fn resolve_objects(
        &self,
        subgraph: &PointerSubgraph,
        _node: PsNodeId,
        pointer: &Pointer,
    ) -> Result<Vec<PsNodeId>, Error> {
        if subgraph.node(pointer.target).is_allocation() {
            Ok(vec![pointer.target])
        } else {
            Err(anyhow!(
                "Pointer target {} is not a memory allocation",
                pointer.target
            ))
        }
    }

    fn function_pointer_call(
        &mut self,
        _subgraph: &mut PointerSubgraph,
        _call: PsNodeId,
        _function: PsNodeId,
    ) -> Result<Vec<PsNodeId>, Error> {
        Ok(Vec::new())
    }
}

/// The memory objects computed by a points-to analysis,
/// to be handed to the downstream analyses after the engine is done.
#[derive(Debug, Default, Clone)]
pub struct PointsToResults {
    /// The memory objects of all written-to allocations, keyed by their allocation site.
    pub objects: FnvHashMap<PsNodeId, MemoryObject>,
}

impl PointsToResults {
    /// Get the memory object of an allocation site, if it has been written to.
    pub fn object_of(&self, alloc: PsNodeId) -> Option<&MemoryObject> {
        self.objects.get(&alloc)
    }
}

/// The points-to analysis engine.
///
/// The engine borrows the subgraph for the duration of the analysis,
/// the computed points-to sets are stored in the subgraph nodes themselves.
pub struct PointerAnalysis<'a, C: PointerAnalysisContext> {
    config: Config,
    context: C,
    subgraph: &'a mut PointerSubgraph,
    objects: FnvHashMap<PsNodeId, MemoryObject>,
    /// A sender to the log collector thread for recoverable findings.
    log_collector: crossbeam_channel::Sender<LogThreadMsg>,
    /// Nodes that the function-pointer callback asked to enqueue.
    pending: Vec<PsNodeId>,
    /// Allocations whose zero-initialization was overwritten by a memory copy.
    /// The flag never comes back, which keeps the fixpoint monotone.
    cleared_zero_init: FnvHashSet<PsNodeId>,
    /// The number of observed points-to changes. Exposed for debugging.
    change_count: u64,
}

impl<'a, C: PointerAnalysisContext> PointerAnalysis<'a, C> {
    /// Create a new points-to analysis over the given subgraph.
    pub fn new(
        subgraph: &'a mut PointerSubgraph,
        context: C,
        config: Config,
        log_collector: crossbeam_channel::Sender<LogThreadMsg>,
    ) -> PointerAnalysis<'a, C> {
        PointerAnalysis {
            config,
            context,
            subgraph,
            objects: FnvHashMap::default(),
            log_collector,
            pending: Vec::new(),
            cleared_zero_init: FnvHashSet::default(),
            change_count: 0,
        }
    }

    /// Run the analysis to its fixpoint.
    ///
    /// The worklist is seeded with all nodes reachable from the given roots
    /// (usually the entry nodes of all procedures) in breadth-first order.
    /// Whenever the transfer function of a node reports a change,
    /// the node's successors and operand users are re-enqueued.
    /// Since stores and memory copies change memory objects
    /// instead of node points-to sets,
    /// the reachable nodes are re-swept until no change is observed anywhere.
    ///
    /// Termination follows from the monotonicity of all transfer functions
    /// over the finite lattice of pointer sets.
    pub fn run(&mut self, roots: &[PsNodeId]) -> Result<(), Error> {
        let mut queue: VecDeque<PsNodeId> = self.subgraph.bfs_order(roots.iter().copied()).into();
        loop {
            let mut users = self.subgraph.users_index();
            while let Some(node) = queue.pop_front() {
                if self.process_node(node)? {
                    self.change_count += 1;
                    self.enqueue_dependents(node, &users, &mut queue);
                }
                if !self.pending.is_empty() {
                    // the callback spliced new subgraph parts in
                    queue.extend(self.pending.drain(..));
                    users = self.subgraph.users_index();
                }
            }
            let mut changed_any = false;
            for node in self.subgraph.bfs_order(roots.iter().copied()) {
                if self.process_node(node)? {
                    self.change_count += 1;
                    changed_any = true;
                    self.enqueue_dependents(node, &users, &mut queue);
                }
                queue.extend(self.pending.drain(..));
            }
            if !changed_any && queue.is_empty() {
                return Ok(());
            }
        }
    }

    /// Consume the analysis and return the computed memory objects.
    pub fn into_results(self) -> PointsToResults {
        PointsToResults {
            objects: self.objects,
        }
    }

    /// Consume the analysis and return its context object.
    pub fn into_context(self) -> C {
        self.context
    }

    /// The number of points-to changes observed so far.
    pub fn change_count(&self) -> u64 {
        self.change_count
    }

    /// Get the memory object of an allocation site, if it has been written to.
    pub fn object_of(&self, alloc: PsNodeId) -> Option<&MemoryObject> {
        self.objects.get(&alloc)
    }

    fn enqueue_dependents(
        &self,
        node: PsNodeId,
        users: &[Vec<PsNodeId>],
        queue: &mut VecDeque<PsNodeId>,
    ) {
        queue.extend(self.subgraph.node(node).successors.iter().copied());
        if let Some(node_users) = users.get(node.index()) {
            queue.extend(node_users.iter().copied());
        }
    }

    /// Send a recoverable finding to the log sink.
    fn report(&self, kind: WarningKind, node: PsNodeId, description: String) {
        let tids = self.subgraph.node(node).tid.iter().cloned().collect();
        let warning = AnalysisWarning::new(kind, description).tids(tids);
        let _ = self.log_collector.send(warning.into());
    }

    /// Apply the transfer function of the given node.
    /// Returns whether the node's points-to set or any memory object changed.
    fn process_node(&mut self, node: PsNodeId) -> Result<bool, Error> {
        match self.subgraph.node(node).kind.clone() {
            PsNodeKind::Load => self.process_load(node),
            PsNodeKind::Store => self.process_store(node),
            PsNodeKind::Gep { offset } => self.process_gep(node, offset),
            PsNodeKind::Cast => {
                let operand = self.subgraph.node(node).operands[0];
                Ok(self.copy_points_to(operand, node))
            }
            PsNodeKind::Phi | PsNodeKind::Return => {
                let operands = self.subgraph.node(node).operands.clone();
                let mut changed = false;
                for operand in operands {
                    changed |= self.copy_points_to(operand, node);
                }
                Ok(changed)
            }
            PsNodeKind::CallReturn => self.process_call_return(node),
            PsNodeKind::CallFuncPtr => self.process_funcptr_call(node),
            PsNodeKind::Memcpy { length } => self.process_memcpy(node, length),
            PsNodeKind::InvalidateLocals => {
                // the parent may have been left unset by frontend rewrites,
                // re-derive it from the operand chain
                let operand = self.subgraph.node(node).operands[0];
                let successor = self
                    .subgraph
                    .single_successor(operand)
                    .ok_or_else(|| anyhow!("Operand of {node} has no unique successor"))?;
                self.subgraph.node_mut(node).parent = self.subgraph.node(successor).parent;
                Ok(false)
            }
            PsNodeKind::Alloc(_) | PsNodeKind::DynAlloc(_) | PsNodeKind::Function { .. } => {
                debug_assert!(self
                    .subgraph
                    .node(node)
                    .points_to
                    .contains(&Pointer::new(node, Offset::new(0))));
                Ok(false)
            }
            PsNodeKind::Constant => {
                if self.subgraph.node(node).points_to.len() != 1 {
                    return Err(anyhow!("Constant {node} must hold exactly one pointer"));
                }
                Ok(false)
            }
            PsNodeKind::NullAddr
            | PsNodeKind::UnknownMem
            | PsNodeKind::Invalidated
            | PsNodeKind::Call
            | PsNodeKind::Entry
            | PsNodeKind::Noop
            | PsNodeKind::Free => Ok(false),
        }
    }

    /// Union the points-to set of `from` into the one of `to`.
    fn copy_points_to(&mut self, from: PsNodeId, to: PsNodeId) -> bool {
        let pointers: Vec<Pointer> = self.subgraph.node(from).points_to.iter().copied().collect();
        let mut changed = false;
        for pointer in pointers {
            changed |= self.subgraph.add_pointer(to, pointer);
        }
        changed
    }

    fn process_load(&mut self, node: PsNodeId) -> Result<bool, Error> {
        let operand = self.subgraph.node(node).operands[0];
        if self.subgraph.node(operand).points_to.is_empty() {
            self.report(
                WarningKind::EmptyOperand,
                node,
                format!("Operand {operand} of load {node} has no points-to set"),
            );
            return Ok(false);
        }
        let mut changed = false;
        let pointers: Vec<Pointer> = self
            .subgraph
            .node(operand)
            .points_to
            .iter()
            .copied()
            .collect();
        for ptr in pointers {
            if ptr.is_null() || ptr.is_invalidated() {
                continue;
            }
            if ptr.is_unknown() {
                // a load from an unknown pointer yields an unknown pointer
                changed |= self.subgraph.add_pointer(node, Pointer::unknown());
                continue;
            }
            let object_keys = self.context.resolve_objects(self.subgraph, node, &ptr)?;
            let target_zero_initialized = self.subgraph.node(ptr.target).is_zero_initialized();
            if object_keys.is_empty() {
                if target_zero_initialized {
                    changed |= self.subgraph.add_pointer(node, Pointer::null());
                } else {
                    self.report(
                        WarningKind::EmptyPointsToLoad,
                        node,
                        format!("Load {node} reads {} which holds no pointers", ptr.target),
                    );
                }
                continue;
            }
            for key in object_keys {
                let mut loaded: Vec<Pointer> = Vec::new();
                let mut empty_read = false;
                match self.objects.get(&key) {
                    None => empty_read = true,
                    Some(object) => {
                        if ptr.offset.is_unknown() {
                            // everything in the object may be referenced
                            if object.is_empty() {
                                empty_read = true;
                            }
                            loaded.extend(object.all_pointers());
                        } else {
                            match object.pointers_at(ptr.offset) {
                                Some(pointers) => loaded.extend(pointers.iter()),
                                None => {
                                    if object.pointers_at(Offset::UNKNOWN).is_none() {
                                        empty_read = true;
                                    }
                                }
                            }
                            // pointers at the unknown offset may alias every offset
                            if let Some(pointers) = object.pointers_at(Offset::UNKNOWN) {
                                loaded.extend(pointers.iter());
                            }
                        }
                    }
                }
                if empty_read {
                    if target_zero_initialized {
                        loaded.push(Pointer::null());
                    } else {
                        self.report(
                            WarningKind::EmptyPointsToLoad,
                            node,
                            format!("Load {node} reads {} which holds no pointers", ptr.target),
                        );
                    }
                }
                for pointer in loaded {
                    changed |= self.subgraph.add_pointer(node, pointer);
                }
            }
        }
        Ok(changed)
    }

    fn process_store(&mut self, node: PsNodeId) -> Result<bool, Error> {
        let value = self.subgraph.node(node).operands[0];
        let address = self.subgraph.node(node).operands[1];
        let addresses: Vec<Pointer> = self
            .subgraph
            .node(address)
            .points_to
            .iter()
            .copied()
            .collect();
        let values: Vec<Pointer> = self.subgraph.node(value).points_to.iter().copied().collect();
        let mut changed = false;
        for ptr in addresses {
            if !ptr.is_valid() || ptr.is_invalidated() {
                continue;
            }
            let object_keys = self.context.resolve_objects(self.subgraph, node, &ptr)?;
            for key in object_keys {
                let object = self
                    .objects
                    .entry(key)
                    .or_insert_with(|| MemoryObject::new(key));
                for stored in &values {
                    changed |= object.add_points_to(ptr.offset, *stored);
                }
            }
        }
        Ok(changed)
    }

    fn process_gep(&mut self, node: PsNodeId, gep_offset: Offset) -> Result<bool, Error> {
        let operand = self.subgraph.node(node).operands[0];
        let pointers: Vec<Pointer> = self
            .subgraph
            .node(operand)
            .points_to
            .iter()
            .copied()
            .collect();
        let max_offset = Offset::new(self.config.max_offset);
        let mut changed = false;
        for ptr in pointers {
            let new_offset = ptr.offset + gep_offset;
            let target_size = self.subgraph.node(ptr.target).size();
            // a zero-sized target makes every concrete offset except 0 unknown
            if (new_offset == Offset::new(0) || new_offset.lt(&target_size))
                && new_offset.lt(&max_offset)
            {
                changed |= self
                    .subgraph
                    .add_pointer(node, Pointer::new(ptr.target, new_offset));
            } else {
                changed |= self
                    .subgraph
                    .node_mut(node)
                    .points_to
                    .insert_unknown_offset(ptr.target);
            }
        }
        Ok(changed)
    }

    fn process_call_return(&mut self, node: PsNodeId) -> Result<bool, Error> {
        let operands = self.subgraph.node(node).operands.clone();
        let mut changed = false;
        if self.config.invalidate_nodes {
            for operand in &operands {
                let pointers: Vec<Pointer> = self
                    .subgraph
                    .node(*operand)
                    .points_to
                    .iter()
                    .copied()
                    .collect();
                for ptr in pointers {
                    let target = self.subgraph.node(ptr.target);
                    if target.is_allocation() && !target.is_heap() && !target.is_global() {
                        changed |= self
                            .subgraph
                            .add_pointer(node, Pointer::new(INVALIDATED, Offset::new(0)));
                    }
                }
            }
        }
        for operand in operands {
            changed |= self.copy_points_to(operand, node);
        }
        Ok(changed)
    }

    fn process_funcptr_call(&mut self, node: PsNodeId) -> Result<bool, Error> {
        let operand = self.subgraph.node(node).operands[0];
        let pointers: Vec<Pointer> = self
            .subgraph
            .node(operand)
            .points_to
            .iter()
            .copied()
            .collect();
        let mut changed = false;
        for ptr in pointers {
            if self.subgraph.add_pointer(node, ptr) {
                changed = true;
                if ptr.is_valid() && !ptr.is_invalidated() {
                    let spliced =
                        self.context
                            .function_pointer_call(self.subgraph, node, ptr.target)?;
                    self.pending.extend(spliced);
                } else {
                    self.report(
                        WarningKind::InvalidFunctionCall,
                        node,
                        format!("Call {node} through an invalid pointer"),
                    );
                }
            }
        }
        Ok(changed)
    }

    fn process_memcpy(&mut self, node: PsNodeId, length: Offset) -> Result<bool, Error> {
        let source = self.subgraph.node(node).operands[0];
        let destination = self.subgraph.node(node).operands[1];
        let source_pointers: Vec<Pointer> = self
            .subgraph
            .node(source)
            .points_to
            .iter()
            .copied()
            .collect();
        let destination_pointers: Vec<Pointer> = self
            .subgraph
            .node(destination)
            .points_to
            .iter()
            .copied()
            .collect();
        let mut changed = false;
        for src_ptr in &source_pointers {
            if !src_ptr.is_valid() || src_ptr.is_invalidated() {
                continue;
            }
            let src_keys = self.context.resolve_objects(self.subgraph, node, src_ptr)?;
            if src_keys.is_empty() {
                return Err(anyhow!(
                    "Memory copy {node} has no resolvable source objects"
                ));
            }
            for dest_ptr in &destination_pointers {
                if !dest_ptr.is_valid() || dest_ptr.is_invalidated() {
                    continue;
                }
                let dest_keys = self
                    .context
                    .resolve_objects(self.subgraph, node, dest_ptr)?;
                if dest_keys.is_empty() {
                    return Err(anyhow!(
                        "Memory copy {node} has no resolvable destination objects"
                    ));
                }
                changed |= self.copy_objects(&src_keys, &dest_keys, src_ptr, dest_ptr, length)?;
            }
        }
        Ok(changed)
    }

    /// Copy the entries in the copied range of the source objects
    /// into the destination objects.
    fn copy_objects(
        &mut self,
        src_keys: &[PsNodeId],
        dest_keys: &[PsNodeId],
        src_ptr: &Pointer,
        dest_ptr: &Pointer,
        length: Offset,
    ) -> Result<bool, Error> {
        let src_offset = src_ptr.offset;
        let dest_offset = dest_ptr.offset;
        let source_alloc = self.subgraph.node(src_ptr.target);
        let dest_alloc = self.subgraph.node(dest_ptr.target);
        if !source_alloc.is_allocation() || !dest_alloc.is_allocation() {
            return Err(anyhow!("Memory copy operand target is not an allocation"));
        }
        let dest_size = dest_alloc.size();
        let max_offset = Offset::new(self.config.max_offset);

        let mut changed = false;
        let covers_destination = !dest_size.is_unknown()
            && length == dest_size
            && dest_offset == Offset::new(0);
        // if the source is zero-initialized, the copy may transfer null pointers
        let mut contains_null_somewhere = false;
        if source_alloc.is_zero_initialized() {
            let src_size = source_alloc.size();
            if !src_size.is_unknown()
                && src_size == dest_size
                && length == src_size
                && src_offset == Offset::new(0)
                && !self.cleared_zero_init.contains(&dest_ptr.target)
            {
                // the copy covers the whole object
                let dest_node = self.subgraph.node_mut(dest_ptr.target);
                if !dest_node.is_zero_initialized() {
                    dest_node.set_zero_initialized();
                    changed = true;
                }
            } else {
                contains_null_somewhere = true;
            }
        } else if covers_destination {
            // overwriting the whole destination decides its initialization
            self.cleared_zero_init.insert(dest_ptr.target);
            let dest_node = self.subgraph.node_mut(dest_ptr.target);
            if dest_node.is_zero_initialized() {
                dest_node.clear_zero_initialized();
                changed = true;
            }
        }

        let source_entries: Vec<(Offset, BTreeSet<Pointer>)> = src_keys
            .iter()
            .filter_map(|key| self.objects.get(key))
            .flat_map(|object| {
                object
                    .iter()
                    .map(|(offset, pointers)| (*offset, pointers.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();

        for dest_key in dest_keys {
            let dest_object = self
                .objects
                .entry(*dest_key)
                .or_insert_with(|| MemoryObject::new(*dest_key));
            if contains_null_somewhere {
                changed |= dest_object.add_points_to(Offset::UNKNOWN, Pointer::null());
            }
            for (src_entry_offset, pointers) in &source_entries {
                let in_range = src_entry_offset.is_unknown()
                    || src_offset.is_unknown()
                    || (src_offset.le(src_entry_offset)
                        && (length.is_unknown()
                            || (*src_entry_offset - src_offset).lt(&length)));
                if !in_range {
                    continue;
                }
                let landing = if src_entry_offset.is_unknown()
                    || src_offset.is_unknown()
                    || dest_offset.is_unknown()
                {
                    Offset::UNKNOWN
                } else {
                    let new_offset = *src_entry_offset - src_offset + dest_offset;
                    if new_offset.is_unknown()
                        || dest_size.le(&new_offset)
                        || max_offset.le(&new_offset)
                    {
                        Offset::UNKNOWN
                    } else {
                        new_offset
                    }
                };
                changed |= dest_object.add_points_to_set(landing, pointers);
            }
        }
        Ok(changed)
    }
}
