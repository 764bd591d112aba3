//! Creating and computing generic fixpoint computations.
//!
//! A fixpoint problem is defined over a directed graph where:
//! - Each node `n` gets assigned a value `val(n)` from a partially ordered set.
//! - Each edge `e` defines a rule `e: value -> value` describing how the value
//!   at the end node is computed from the value at the start node of the edge.
//!
//! A fixpoint is reached when `e(val(start_node)) <= val(end_node)` holds for all edges.
//! The computation finds the smallest such assignment
//! that is not less than the given starting values.
//!
//! Edge transition functions may return `None`
//! to indicate that no information flows through the edge for the given value.
//! In that case the value at the end node of the edge is not updated.
//!
//! To solve a fixpoint problem, implement the [`Context`] trait,
//! create a [`Computation`] from it, set the starting node values
//! and call [`compute()`](Computation::compute).

use fnv::FnvHashMap;
use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use petgraph::visit::EdgeRef;
use std::collections::{BTreeMap, BTreeSet};

/// The context of a fixpoint computation:
/// the underlying graph together with the merge and edge transition functions.
pub trait Context {
    /// The type of the edge labels of the underlying graph.
    type EdgeLabel: Clone;
    /// The type of the node labels of the underlying graph.
    type NodeLabel;
    /// The type of the values assigned to nodes.
    /// The values should form a partially ordered set.
    type NodeValue: PartialEq + Eq + Clone;

    /// Get the graph on which the fixpoint computation operates.
    fn get_graph(&self) -> &DiGraph<Self::NodeLabel, Self::EdgeLabel>;

    /// Merge two node values into their least upper bound.
    fn merge(&self, value1: &Self::NodeValue, value2: &Self::NodeValue) -> Self::NodeValue;

    /// Compute the value at the end node of `edge` from the value at its start node.
    /// Return `None` if no information flows through the edge.
    fn update_edge(&self, value: &Self::NodeValue, edge: EdgeIndex) -> Option<Self::NodeValue>;
}

/// An intermediate result of a fixpoint computation
/// with methods to continue the computation and to extract results.
pub struct Computation<T: Context> {
    /// The context object of the fixpoint computation.
    fp_context: T,
    /// Maps a node index to its priority. Nodes with higher priority get stabilized first.
    node_priority_list: Vec<usize>,
    /// Maps a priority to the corresponding node index.
    priority_to_node_list: Vec<NodeIndex>,
    /// The priorities (not the node indices) of all nodes that are not yet stabilized.
    worklist: BTreeSet<usize>,
    /// The current values of all nodes that have one.
    node_values: FnvHashMap<NodeIndex, T::NodeValue>,
}

impl<T: Context> Computation<T> {
    /// Create a new fixpoint computation from a context
    /// and an optional default value assigned to every node.
    ///
    /// The node priorities are derived from a weak topological order of the graph,
    /// so that the worklist algorithm stabilizes nodes close to the graph roots first.
    pub fn new(fp_context: T, default_value: Option<T::NodeValue>) -> Self {
        let graph = fp_context.get_graph();
        let priority_sorted_nodes: Vec<NodeIndex> = petgraph::algo::kosaraju_scc(&graph)
            .into_iter()
            .flatten()
            .collect();
        let mut node_to_priority = BTreeMap::new();
        for (priority, node_index) in priority_sorted_nodes.iter().enumerate() {
            node_to_priority.insert(node_index, priority);
        }
        let node_priority_list: Vec<usize> = node_to_priority.values().copied().collect();
        let mut worklist = BTreeSet::new();
        let mut node_values: FnvHashMap<NodeIndex, T::NodeValue> = FnvHashMap::default();
        if let Some(default) = default_value {
            for priority in 0..priority_sorted_nodes.len() {
                worklist.insert(priority);
                node_values.insert(priority_sorted_nodes[priority], default.clone());
            }
        }
        Computation {
            fp_context,
            node_priority_list,
            priority_to_node_list: priority_sorted_nodes,
            worklist,
            node_values,
        }
    }

    /// Get the value of a node.
    pub fn get_node_value(&self, node: NodeIndex) -> Option<&T::NodeValue> {
        self.node_values.get(&node)
    }

    /// Set the value of a node and mark the node as not yet stabilized.
    pub fn set_node_value(&mut self, node: NodeIndex, value: T::NodeValue) {
        self.node_values.insert(node, value);
        self.worklist.insert(self.node_priority_list[node.index()]);
    }

    /// Merge the value at a node with a new value arriving over an edge.
    fn merge_node_value(&mut self, node: NodeIndex, value: T::NodeValue) {
        if let Some(old_value) = self.node_values.get(&node) {
            let merged_value = self.fp_context.merge(&value, old_value);
            if merged_value != *old_value {
                self.set_node_value(node, merged_value);
            }
        } else {
            self.set_node_value(node, value);
        }
    }

    /// Compute and update the value at the end node of an edge.
    fn update_edge(&mut self, edge: EdgeIndex) {
        let (start_node, end_node) = self
            .fp_context
            .get_graph()
            .edge_endpoints(edge)
            .expect("Edge not found");
        if let Some(start_value) = self.node_values.get(&start_node) {
            if let Some(new_end_value) = self.fp_context.update_edge(start_value, edge) {
                self.merge_node_value(end_node, new_end_value);
            }
        }
    }

    /// Update all outgoing edges of a node.
    fn update_node(&mut self, node: NodeIndex) {
        let edges: Vec<EdgeIndex> = self
            .fp_context
            .get_graph()
            .edges(node)
            .map(|edge_ref| edge_ref.id())
            .collect();
        for edge in edges {
            self.update_edge(edge);
        }
    }

    /// Remove the highest priority node from the worklist and return it.
    fn take_next_node_from_worklist(&mut self) -> Option<NodeIndex> {
        let priority = self.worklist.pop_last()?;
        Some(self.priority_to_node_list[priority])
    }

    /// Compute the fixpoint of the fixpoint problem,
    /// visiting each node at most `max_steps` times.
    ///
    /// If some node does not stabilize in `max_steps` visits,
    /// the end result is not a fixpoint but only an intermediate result,
    /// and the non-stabilized nodes remain on the worklist.
    pub fn compute_with_max_steps(&mut self, max_steps: u64) {
        let mut steps = vec![0; self.fp_context.get_graph().node_count()];
        let mut non_stabilized_nodes = BTreeSet::new();
        while let Some(priority) = self.worklist.pop_last() {
            let node = self.priority_to_node_list[priority];
            if steps[node.index()] < max_steps {
                steps[node.index()] += 1;
                self.update_node(node);
            } else {
                non_stabilized_nodes.insert(priority);
            }
        }
        self.worklist = non_stabilized_nodes;
    }

    /// Compute the fixpoint of the fixpoint problem.
    /// Does not terminate if the values at some node never stabilize.
    pub fn compute(&mut self) {
        while let Some(node) = self.take_next_node_from_worklist() {
            self.update_node(node);
        }
    }

    /// Get the map containing the current values of all nodes.
    pub fn node_values(&self) -> &FnvHashMap<NodeIndex, T::NodeValue> {
        &self.node_values
    }

    /// Get a reference to the underlying graph.
    pub fn get_graph(&self) -> &DiGraph<T::NodeLabel, T::EdgeLabel> {
        self.fp_context.get_graph()
    }

    /// Get a reference to the context object of the computation.
    pub fn get_context(&self) -> &T {
        &self.fp_context
    }

    /// Returns true if the computation has stabilized,
    /// i.e. the internal worklist is empty.
    pub fn has_stabilized(&self) -> bool {
        self.worklist.is_empty()
    }
}
