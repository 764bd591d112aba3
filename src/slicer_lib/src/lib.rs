/*!
# slicer_lib

A library for computing program slices of imperative programs.

Given a module in the [intermediate representation](intermediate_representation)
and one or more *slicing criteria* (call sites or return points),
the library computes the subset of program operations
whose execution can affect the criteria.
The slice is obtained by transitively following data-dependence,
control-dependence and use edges in a program dependence graph.

The analysis substrate consists of:
* a [pointer subgraph](pointer::subgraph) together with a flow-sensitive,
  field-sensitive, inclusion-based [points-to analysis](analysis::pointer_analysis),
* a [dependence graph](graph) with per-procedure node containers,
  basic blocks and call bindings,
* a [reaching-definitions analysis](analysis::reaching_definitions)
  and a [def-use linker](analysis::def_use) that add data-dependence edges,
* a [post-dominance computation](analysis::post_dominance)
  that adds control-dependence edges,
* and the [slicer](slicing) itself,
  which marks the backward dependence closure of the criteria
  and prunes everything else.

The [frontend](frontend) module lowers the intermediate representation
to the analysis graphs and maps slice results back to a pruned module.
See the `slicer` binary for the corresponding command line tool.
*/

pub mod analysis;
pub mod frontend;
pub mod graph;
pub mod intermediate_representation;
pub mod pointer;
pub mod slicing;
pub mod utils;

mod prelude {
    pub use serde::{Deserialize, Serialize};

    pub use crate::intermediate_representation::{Term, Tid};
    pub use anyhow::{anyhow, Error};
}
