//! The dependence graphs that the slicer operates on.
//!
//! A [`SliceModule`] is an arena owning one [`DependenceGraph`] per procedure
//! together with all their nodes and basic blocks.
//! Graphs, nodes and blocks are referenced through integer handles
//! ([`DgId`], [`DgNodeId`], [`BlockId`]),
//! so edges can freely connect nodes of different graphs,
//! e.g. for parameter bindings at call boundaries.
//!
//! A dependence graph acts as a namespace for its nodes:
//! every node has a key that is unique inside its graph,
//! but the same key may appear in several graphs.
//! Each graph carries a reference count.
//! The count is incremented for every call site attached to the graph
//! and graphs are destroyed when their count drops to zero,
//! which in turn releases the graphs of their callees.
//! Global variables live in a global-nodes table
//! that can be shared between graphs;
//! exactly one graph owns the shared table.

use crate::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

pub mod basic_block;
pub mod node;

pub use basic_block::BasicBlock;
pub use node::DgNode;


/// The handle of a dependence graph inside a [`SliceModule`].
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub struct DgId(usize);

/// The handle of a dependence graph node inside a [`SliceModule`].
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub struct DgNodeId(usize);

/// The handle of a basic block inside a [`SliceModule`].
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub struct BlockId(usize);

/// The handle of a shared global-nodes table inside a [`SliceModule`].
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub struct GlobalsId(usize);

impl std::fmt::Display for DgNodeId {
    fn fmt(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(formatter, "dg{}", self.0)
    }
}

/// The dependence graph of one procedure.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DependenceGraph {
    /// The name of the procedure the graph belongs to.
    pub name: String,
    /// Maps node keys to the nodes of this graph.
    nodes: BTreeMap<Tid, DgNodeId>,
    /// The formal parameter (input) nodes of the procedure.
    formal_params: BTreeMap<Tid, DgNodeId>,
    /// The formal parameter nodes in declaration order.
    formal_param_order: Vec<DgNodeId>,
    /// The parameter-out node carrying the returned value.
    ret_param: Option<DgNodeId>,
    entry: Option<DgNodeId>,
    exit: Option<DgNodeId>,
    /// The shared global-nodes table visible from this graph.
    globals: Option<GlobalsId>,
    /// Whether this graph owns the shared table and destroys it.
    own_global_nodes: bool,
    /// The call nodes calling this graph.
    callers: BTreeSet<DgNodeId>,
    /// The number of owners keeping this graph alive.
    refcount: i64,
    /// The id of the last slice this graph was part of.
    pub slice_id: u64,
    entry_block: Option<BlockId>,
    exit_block: Option<BlockId>,
    /// All blocks of the graph, in creation order.
    blocks: Vec<BlockId>,
    alive: bool,
}

impl DependenceGraph {
    fn new(name: String) -> DependenceGraph {
        DependenceGraph {
            name,
            nodes: BTreeMap::new(),
            formal_params: BTreeMap::new(),
            formal_param_order: Vec::new(),
            ret_param: None,
            entry: None,
            exit: None,
            globals: None,
            own_global_nodes: false,
            callers: BTreeSet::new(),
            refcount: 1,
            slice_id: 0,
            entry_block: None,
            exit_block: None,
            blocks: Vec::new(),
            alive: true,
        }
    }

    /// The number of nodes contained in the graph, not counting parameters.
    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if a node with the given key is contained in the graph itself.
    pub fn contains(&self, key: &Tid) -> bool {
        self.nodes.contains_key(key)
    }

    /// Iterate over the nodes of the graph together with their keys.
    pub fn nodes(&self) -> impl Iterator<Item = (&Tid, &DgNodeId)> {
        self.nodes.iter()
    }

    /// The formal parameter nodes of the graph.
    pub fn formal_params(&self) -> &BTreeMap<Tid, DgNodeId> {
        &self.formal_params
    }

    /// The formal parameter nodes in declaration order.
    pub fn formal_param_order(&self) -> &[DgNodeId] {
        &self.formal_param_order
    }

    /// All nodes belonging to the graph:
    /// its own nodes, the formal parameters and the parameter-out node.
    pub fn all_node_ids(&self) -> Vec<DgNodeId> {
        let mut ids: Vec<DgNodeId> = self.nodes.values().copied().collect();
        ids.extend(self.formal_param_order.iter().copied());
        ids.extend(self.ret_param);
        ids
    }

    /// The parameter-out node carrying the returned value, if any.
    pub fn ret_param(&self) -> Option<DgNodeId> {
        self.ret_param
    }

    /// The entry node of the graph.
    pub fn entry(&self) -> Option<DgNodeId> {
        self.entry
    }

    /// The exit node of the graph.
    pub fn exit(&self) -> Option<DgNodeId> {
        self.exit
    }

    /// The call nodes calling this graph.
    pub fn callers(&self) -> &BTreeSet<DgNodeId> {
        &self.callers
    }

    /// The current reference count of the graph.
    pub fn refcount(&self) -> i64 {
        self.refcount
    }

    /// Returns true if the graph has not been destroyed.
    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Returns true if this graph owns the shared global-nodes table.
    pub fn owns_global_nodes(&self) -> bool {
        self.own_global_nodes
    }

    /// The shared global-nodes table visible from this graph, if any.
    pub fn globals(&self) -> Option<GlobalsId> {
        self.globals
    }

    /// The entry block of the graph.
    pub fn entry_block(&self) -> Option<BlockId> {
        self.entry_block
    }

    /// The exit block of the graph.
    pub fn exit_block(&self) -> Option<BlockId> {
        self.exit_block
    }

    /// All blocks of the graph, including removed ones.
    pub fn blocks(&self) -> &[BlockId] {
        &self.blocks
    }

    /// Mark the graph as being part of the given slice.
    pub fn set_slice(&mut self, slice_id: u64) {
        self.slice_id = slice_id;
    }
}

/// The arena owning all dependence graphs of a program.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct SliceModule {
    graphs: Vec<DependenceGraph>,
    nodes: Vec<DgNode>,
    blocks: Vec<BasicBlock>,
    global_tables: Vec<BTreeMap<Tid, DgNodeId>>,
    /// Where the control flow of removed blocks was redirected to.
    redirects: BTreeMap<BlockId, Option<BlockId>>,
}

impl SliceModule {
    /// Create a new, empty module.
    pub fn new() -> SliceModule {
        SliceModule::default()
    }

    /// Create a new dependence graph with reference count 1.
    pub fn create_graph(&mut self, name: impl Into<String>) -> DgId {
        let id = DgId(self.graphs.len());
        self.graphs.push(DependenceGraph::new(name.into()));
        id
    }

    /// Get a reference to a graph.
    pub fn graph(&self, id: DgId) -> &DependenceGraph {
        &self.graphs[id.0]
    }

    /// Get a mutable reference to a graph.
    pub fn graph_mut(&mut self, id: DgId) -> &mut DependenceGraph {
        &mut self.graphs[id.0]
    }

    /// Iterate over the handles of all graphs that are still alive.
    pub fn graph_ids(&self) -> impl Iterator<Item = DgId> + '_ {
        self.graphs
            .iter()
            .enumerate()
            .filter(|(_, graph)| graph.alive)
            .map(|(index, _)| DgId(index))
    }

    /// Find an alive graph by its procedure name.
    pub fn find_graph_by_name(&self, name: &str) -> Option<DgId> {
        self.graph_ids()
            .find(|id| self.graphs[id.0].name == name)
    }

    /// Get a reference to a node.
    pub fn node(&self, id: DgNodeId) -> &DgNode {
        &self.nodes[id.0]
    }

    /// Get a mutable reference to a node.
    pub fn node_mut(&mut self, id: DgNodeId) -> &mut DgNode {
        &mut self.nodes[id.0]
    }

    /// Get a reference to a basic block.
    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.0]
    }

    /// Get a mutable reference to a basic block.
    pub fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        &mut self.blocks[id.0]
    }

    /// Add a node with the given key to a graph.
    ///
    /// Returns `None` without modifying anything
    /// if the graph already contains a node with this key.
    pub fn add_node(&mut self, graph: DgId, key: Tid) -> Option<DgNodeId> {
        if self.graphs[graph.0].nodes.contains_key(&key) {
            return None;
        }
        let id = DgNodeId(self.nodes.len());
        self.nodes.push(DgNode::new(key.clone(), graph));
        self.graphs[graph.0].nodes.insert(key, id);
        Some(id)
    }

    /// Add a formal parameter (input) node to a graph.
    pub fn add_formal_param(&mut self, graph: DgId, key: Tid) -> Option<DgNodeId> {
        if self.graphs[graph.0].formal_params.contains_key(&key) {
            return None;
        }
        let id = DgNodeId(self.nodes.len());
        self.nodes.push(DgNode::new(key.clone(), graph));
        self.graphs[graph.0].formal_params.insert(key, id);
        self.graphs[graph.0].formal_param_order.push(id);
        Some(id)
    }

    /// Create the parameter-out node of a graph that carries the returned value.
    pub fn set_ret_param(&mut self, graph: DgId, key: Tid) -> DgNodeId {
        if let Some(ret) = self.graphs[graph.0].ret_param {
            return ret;
        }
        let id = DgNodeId(self.nodes.len());
        self.nodes.push(DgNode::new(key, graph));
        self.graphs[graph.0].ret_param = Some(id);
        id
    }

    /// Add a node to the global-nodes table visible from the given graph.
    ///
    /// If the graph does not see a table yet, a new one owned by it is created.
    /// The node is owned by the graph owning the table.
    /// Returns `None` if a global node with this key already exists.
    ///
    /// Adding to a shared table that is still empty while not owning it
    /// leaves the owner undeterminable and is a precondition violation;
    /// the calling graph is then treated as the owner.
    pub fn add_global_node(&mut self, graph: DgId, key: Tid) -> Option<DgNodeId> {
        let table_id = match self.graphs[graph.0].globals {
            Some(table_id) => table_id,
            None => {
                let table_id = GlobalsId(self.global_tables.len());
                self.global_tables.push(BTreeMap::new());
                let graph_data = &mut self.graphs[graph.0];
                graph_data.globals = Some(table_id);
                graph_data.own_global_nodes = true;
                table_id
            }
        };
        if self.global_tables[table_id.0].contains_key(&key) {
            return None;
        }
        let owner = if self.graphs[graph.0].own_global_nodes {
            graph
        } else {
            match self.global_tables[table_id.0].values().next() {
                Some(first) => self.nodes[first.0].graph,
                None => {
                    debug_assert!(false, "Shared global-nodes table without an owner");
                    graph
                }
            }
        };
        let id = DgNodeId(self.nodes.len());
        self.nodes.push(DgNode::new(key.clone(), owner));
        self.global_tables[table_id.0].insert(key, id);
        Some(id)
    }

    /// Let a graph share the global-nodes table of another graph.
    pub fn share_global_nodes(&mut self, from: DgId, to: DgId) {
        self.graphs[to.0].globals = self.graphs[from.0].globals;
    }

    /// Get the node with the given key from a graph.
    ///
    /// The key is searched in the graph's own nodes,
    /// then in its formal parameters
    /// and finally in the shared global nodes.
    pub fn get_node(&self, graph: DgId, key: &Tid) -> Option<DgNodeId> {
        let graph_data = &self.graphs[graph.0];
        if let Some(id) = graph_data.nodes.get(key) {
            return Some(*id);
        }
        if let Some(id) = graph_data.formal_params.get(key) {
            return Some(*id);
        }
        self.get_global_node(graph, key)
    }

    /// Get the global node with the given key, if the graph sees a global table.
    pub fn get_global_node(&self, graph: DgId, key: &Tid) -> Option<DgNodeId> {
        let table_id = self.graphs[graph.0].globals?;
        self.global_tables[table_id.0].get(key).copied()
    }

    /// Set the entry node of a graph. Returns the previous entry node.
    pub fn set_entry(&mut self, graph: DgId, node: DgNodeId) -> Option<DgNodeId> {
        self.graphs[graph.0].entry.replace(node)
    }

    /// Set the exit node of a graph. Returns the previous exit node.
    pub fn set_exit(&mut self, graph: DgId, node: DgNodeId) -> Option<DgNodeId> {
        self.graphs[graph.0].exit.replace(node)
    }

    /// Increment the reference count of a graph and return the new count.
    pub fn ref_graph(&mut self, graph: DgId) -> i64 {
        self.graphs[graph.0].refcount += 1;
        self.graphs[graph.0].refcount
    }

    /// Decrement the reference count of a graph and return the new count.
    /// The graph is destroyed when the count reaches zero,
    /// which also releases the references it holds to the graphs of its callees.
    pub fn unref_graph(&mut self, graph: DgId) -> i64 {
        self.graphs[graph.0].refcount -= 1;
        let refcount = self.graphs[graph.0].refcount;
        debug_assert!(refcount >= 0, "Negative graph reference count");
        if refcount == 0 {
            self.destroy_graph(graph);
        }
        refcount
    }

    /// Attach a call site to the graph of its callee.
    ///
    /// The call node records the callee
    /// and the callee's caller set and reference count are updated.
    pub fn set_callee(&mut self, call: DgNodeId, callee: DgId) {
        self.nodes[call.0].callee = Some(callee);
        if self.graphs[callee.0].callers.insert(call) {
            self.ref_graph(callee);
        }
    }

    /// Add a data-dependence edge. Returns true if the edge is new.
    pub fn add_data_edge(&mut self, from: DgNodeId, to: DgNodeId) -> bool {
        let inserted = self.nodes[from.0].data_deps.insert(to);
        if inserted {
            self.nodes[to.0].rev_data_deps.insert(from);
        }
        inserted
    }

    /// Add a control-dependence edge. Returns true if the edge is new.
    pub fn add_control_edge(&mut self, from: DgNodeId, to: DgNodeId) -> bool {
        let inserted = self.nodes[from.0].control_deps.insert(to);
        if inserted {
            self.nodes[to.0].rev_control_deps.insert(from);
        }
        inserted
    }

    /// Add a use edge from a defining node to a user. Returns true if the edge is new.
    pub fn add_use_edge(&mut self, from: DgNodeId, to: DgNodeId) -> bool {
        let inserted = self.nodes[from.0].use_deps.insert(to);
        if inserted {
            self.nodes[to.0].rev_use_deps.insert(from);
        }
        inserted
    }

    /// Sever all edges incident to the given node.
    pub fn isolate_node(&mut self, node: DgNodeId) {
        let data_deps: Vec<DgNodeId> = self.nodes[node.0].data_deps.iter().copied().collect();
        for to in data_deps {
            self.nodes[to.0].rev_data_deps.remove(&node);
        }
        let rev_data_deps: Vec<DgNodeId> =
            self.nodes[node.0].rev_data_deps.iter().copied().collect();
        for from in rev_data_deps {
            self.nodes[from.0].data_deps.remove(&node);
        }
        let control_deps: Vec<DgNodeId> = self.nodes[node.0].control_deps.iter().copied().collect();
        for to in control_deps {
            self.nodes[to.0].rev_control_deps.remove(&node);
        }
        let rev_control_deps: Vec<DgNodeId> =
            self.nodes[node.0].rev_control_deps.iter().copied().collect();
        for from in rev_control_deps {
            self.nodes[from.0].control_deps.remove(&node);
        }
        let use_deps: Vec<DgNodeId> = self.nodes[node.0].use_deps.iter().copied().collect();
        for to in use_deps {
            self.nodes[to.0].rev_use_deps.remove(&node);
        }
        let rev_use_deps: Vec<DgNodeId> = self.nodes[node.0].rev_use_deps.iter().copied().collect();
        for from in rev_use_deps {
            self.nodes[from.0].use_deps.remove(&node);
        }
        let isolated = &mut self.nodes[node.0];
        isolated.data_deps.clear();
        isolated.rev_data_deps.clear();
        isolated.control_deps.clear();
        isolated.rev_control_deps.clear();
        isolated.use_deps.clear();
        isolated.rev_use_deps.clear();
    }

    /// Remove a node from its graph:
    /// isolate it and unlink it from its graph and block.
    /// The node itself is not destroyed.
    pub fn remove_node(&mut self, node: DgNodeId) {
        self.isolate_node(node);
        let graph = self.nodes[node.0].graph;
        let key = self.nodes[node.0].key.clone();
        let graph_data = &mut self.graphs[graph.0];
        if graph_data.nodes.get(&key) == Some(&node) {
            graph_data.nodes.remove(&key);
        } else if graph_data.formal_params.get(&key) == Some(&node) {
            graph_data.formal_params.remove(&key);
        } else if graph_data.ret_param == Some(node) {
            graph_data.ret_param = None;
        } else if let Some(table_id) = graph_data.globals {
            if self.global_tables[table_id.0].get(&key) == Some(&node) {
                self.global_tables[table_id.0].remove(&key);
            }
        }
        if let Some(block_id) = self.nodes[node.0].block.take() {
            self.blocks[block_id.0].nodes.retain(|member| *member != node);
        }
    }

    /// Remove a node and destroy it.
    ///
    /// If the node is a call node, its reference to the callee dies with it,
    /// which may destroy the callee graph.
    pub fn delete_node(&mut self, node: DgNodeId) {
        self.remove_node(node);
        self.nodes[node.0].alive = false;
        if let Some(callee) = self.nodes[node.0].callee.take() {
            if self.graphs[callee.0].alive {
                self.graphs[callee.0].callers.remove(&node);
                self.unref_graph(callee);
            }
        }
    }

    /// Add a basic block to a graph.
    pub fn add_block(&mut self, graph: DgId, key: Tid) -> BlockId {
        let id = BlockId(self.blocks.len());
        self.blocks.push(BasicBlock::new(key, graph));
        self.graphs[graph.0].blocks.push(id);
        id
    }

    /// Append a node to a basic block.
    pub fn push_node_to_block(&mut self, block: BlockId, node: DgNodeId) {
        self.blocks[block.0].nodes.push(node);
        self.nodes[node.0].block = Some(block);
    }

    /// Add a control flow edge between two blocks.
    pub fn connect_blocks(&mut self, from: BlockId, to: BlockId) {
        self.blocks[from.0].successors.insert(to);
        self.blocks[to.0].predecessors.insert(from);
    }

    /// Set the entry block of a graph. Returns the previous entry block.
    pub fn set_entry_block(&mut self, graph: DgId, block: BlockId) -> Option<BlockId> {
        self.graphs[graph.0].entry_block.replace(block)
    }

    /// Set the exit block of a graph. Returns the previous exit block.
    pub fn set_exit_block(&mut self, graph: DgId, block: BlockId) -> Option<BlockId> {
        self.graphs[graph.0].exit_block.replace(block)
    }

    /// Remove a block from the control flow graph and stitch the gap:
    /// the predecessors are connected to the unique live successor of the block
    /// or to the block's immediate post-dominator
    /// if several successors are still alive.
    pub fn remove_block_from_cfg(&mut self, block: BlockId) {
        let predecessors: Vec<BlockId> =
            self.blocks[block.0].predecessors.iter().copied().collect();
        let successors: Vec<BlockId> = self.blocks[block.0].successors.iter().copied().collect();
        for predecessor in &predecessors {
            self.blocks[predecessor.0].successors.remove(&block);
        }
        for successor in &successors {
            self.blocks[successor.0].predecessors.remove(&block);
        }
        let live_successors: Vec<BlockId> = successors
            .iter()
            .copied()
            .filter(|successor| self.blocks[successor.0].alive)
            .collect();
        let stitch_target = match live_successors[..] {
            [unique] => Some(unique),
            [] => None,
            _ => self.blocks[block.0]
                .ipostdom
                .filter(|ipostdom| self.blocks[ipostdom.0].alive),
        };
        if let Some(target) = stitch_target {
            for predecessor in predecessors {
                if self.blocks[predecessor.0].alive && predecessor != target {
                    self.connect_blocks(predecessor, target);
                }
            }
        }
        self.redirects.insert(block, stitch_target);
        self.blocks[block.0].alive = false;
        self.blocks[block.0].successors.clear();
        self.blocks[block.0].predecessors.clear();
    }

    /// Follow the redirects of removed blocks to the block
    /// that took over their place in the control flow, if any.
    pub fn surviving_block(&self, block: BlockId) -> Option<BlockId> {
        let mut current = block;
        let mut seen = BTreeSet::new();
        while !self.blocks[current.0].alive {
            if !seen.insert(current) {
                return None;
            }
            current = (*self.redirects.get(&current)?)?;
        }
        Some(current)
    }

    /// All nodes living in the shared global-nodes tables.
    pub fn global_node_ids(&self) -> Vec<DgNodeId> {
        self.global_tables
            .iter()
            .flat_map(|table| table.values().copied())
            .collect()
    }

    /// Destroy a graph: destroy all its nodes and blocks
    /// and release the references to the graphs of its callees.
    fn destroy_graph(&mut self, graph: DgId) {
        // mark the graph dead first, so that call cycles back into it
        // cannot release it a second time
        self.graphs[graph.0].alive = false;
        let mut node_ids: Vec<DgNodeId> = self.graphs[graph.0].nodes.values().copied().collect();
        node_ids.extend(self.graphs[graph.0].formal_params.values().copied());
        node_ids.extend(self.graphs[graph.0].ret_param);
        // deleting the call nodes releases the references to the callee graphs
        for node in node_ids {
            self.delete_node(node);
        }
        let graph_data = &mut self.graphs[graph.0];
        let blocks = std::mem::take(&mut graph_data.blocks);
        graph_data.entry = None;
        graph_data.exit = None;
        graph_data.entry_block = None;
        graph_data.exit_block = None;
        let owned_globals = if graph_data.own_global_nodes {
            graph_data.globals
        } else {
            None
        };
        for block in blocks {
            self.blocks[block.0].alive = false;
        }
        if let Some(table_id) = owned_globals {
            let global_nodes: Vec<DgNodeId> =
                self.global_tables[table_id.0].values().copied().collect();
            for node in global_nodes {
                self.delete_node(node);
            }
            self.global_tables[table_id.0].clear();
        }
    }

    /// The total number of alive nodes in the module.
    pub fn alive_node_count(&self) -> usize {
        self.nodes.iter().filter(|node| node.alive).count()
    }
}
