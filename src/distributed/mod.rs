//! Data-parallel replication
//!
//! Every worker holds a full copy of the model and a [`Replica`] handle.
//! Replicas start from the same parameters, average gradients once per phase
//! and check after rank adaptation that all workers picked the same ranks.

mod collective;
mod replica;

pub use collective::{Collective, LocalCollective, ThreadGroup, ThreadWorker};
pub use replica::{ParamSubset, Replica};
