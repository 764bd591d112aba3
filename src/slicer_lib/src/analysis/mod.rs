//! The analyses that compute the information the slicer runs on.
//!
//! The intended pipeline is the one of the command line driver:
//! run the [points-to analysis](pointer_analysis) to a fixpoint,
//! compute [reaching definitions](reaching_definitions),
//! add data-dependence edges with the [def-use linker](def_use),
//! then add control-dependence edges via [post-dominance](post_dominance).
//! Afterwards the dependence graphs are ready for
//! [slicing](crate::slicing).

pub mod def_use;
pub mod fixpoint;
pub mod pointer_analysis;
pub mod post_dominance;
pub mod reaching_definitions;
