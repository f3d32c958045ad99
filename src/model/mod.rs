//! Model graph and the layer orchestrator
//!
//! A [`Model`] is an arena of named nodes; containers list their children by
//! [`NodeId`]. The orchestrator rebuilds a model with factorized layers and
//! broadcasts [`LayerCommand`](crate::lowrank::LayerCommand)s to every
//! low-rank node.

mod graph;
mod orchestrator;

#[cfg(test)]
mod tests;

pub use graph::{Model, Node, NodeId};
pub use orchestrator::{
    broadcast, get_all_ranks, replace_linear_layers, reset_last_layer_to_dense, LastEligible,
    ReplacementReport,
};
