//! Per-worker replication handle

use super::{Collective, LocalCollective};
use crate::error::{Error, Result};
use crate::model::Model;
use ndarray::Array1;
use tracing::debug;

/// Which parameters take part in a gradient all-reduce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamSubset {
    /// Every parameter of the model
    All,
    /// Parameters currently marked trainable (the active phase's factors)
    Active,
}

/// A worker's view of the data-parallel group
pub struct Replica {
    collective: Box<dyn Collective>,
}

impl Replica {
    pub fn new(collective: Box<dyn Collective>) -> Self {
        Self { collective }
    }

    /// Single-process replica
    pub fn local() -> Self {
        Self::new(Box::new(LocalCollective))
    }

    pub fn rank(&self) -> usize {
        self.collective.rank()
    }

    pub fn world_size(&self) -> usize {
        self.collective.world_size()
    }

    /// Whether this worker logs on behalf of the group
    pub fn is_primary(&self) -> bool {
        self.rank() == 0
    }

    /// Copy worker 0's parameters and orthonormal buffers to every worker
    pub fn broadcast_model(&self, model: &mut Model) -> Result<()> {
        if self.world_size() == 1 {
            return Ok(());
        }
        for param in model.parameters_mut() {
            let mut values = param.data().to_vec();
            self.collective.broadcast(&mut values, 0)?;
            *param.data_mut() = Array1::from(values);
        }
        for buffer in model.buffers_mut() {
            self.collective.broadcast(buffer.as_mut_slice(), 0)?;
        }
        debug!(rank = self.rank(), "Synchronized model from worker 0");
        Ok(())
    }

    /// Average gradients across workers
    ///
    /// Missing gradients count as zero in the sum; only parameters that
    /// had a local gradient receive the mean.
    pub fn all_reduce_gradients(&self, model: &Model, subset: ParamSubset) -> Result<()> {
        if self.world_size() == 1 {
            return Ok(());
        }
        let params: Vec<_> = model
            .parameters()
            .into_iter()
            .filter(|p| subset == ParamSubset::All || p.requires_grad())
            .collect();

        let mut flat: Vec<f32> = Vec::with_capacity(params.iter().map(|p| p.len()).sum());
        for param in &params {
            match param.grad() {
                Some(grad) => flat.extend(grad.iter()),
                None => flat.resize(flat.len() + param.len(), 0.0),
            }
        }
        self.collective.all_reduce_sum(&mut flat)?;

        let scale = 1.0 / self.world_size() as f32;
        let mut offset = 0;
        for param in params {
            let len = param.len();
            if param.grad().is_some() {
                let mean = flat[offset..offset + len].iter().map(|g| g * scale).collect();
                param.set_grad(Array1::from_vec(mean));
            }
            offset += len;
        }
        Ok(())
    }

    /// Mean of `values` across workers, in place
    pub fn all_reduce_mean(&self, values: &mut [f32]) -> Result<()> {
        self.collective.all_reduce_sum(values)?;
        let world = self.world_size() as f32;
        values.iter_mut().for_each(|v| *v /= world);
        Ok(())
    }

    /// Sum of `values` across workers, in place
    pub fn all_reduce_sum(&self, values: &mut [f32]) -> Result<()> {
        self.collective.all_reduce_sum(values)
    }

    /// Fail unless every worker reports the same per-layer ranks
    pub fn check_rank_agreement(&self, ranks: &[usize]) -> Result<()> {
        let worker_ranks = self.collective.all_gather(ranks)?;
        if worker_ranks.iter().any(|r| r.as_slice() != ranks) {
            return Err(Error::RankDivergence { worker_ranks });
        }
        Ok(())
    }
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("rank", &self.rank())
            .field("world_size", &self.world_size())
            .finish()
    }
}

impl Default for Replica {
    fn default() -> Self {
        Self::local()
    }
}
