//! Low-rank replacement for a dense linear layer

use super::config::{LayerKind, LowRankConfig};
use super::linalg::to_row_major;
use super::{LowRankCore, LowRankUnit};
use crate::autograd::Context;
use crate::error::Result;
use crate::nn::linear::rows_of;
use crate::nn::Linear;
use crate::Tensor;
use rand::rngs::StdRng;

/// `Y = X · U·S·Vᵀ + b` trained through the K/L/S phases
#[derive(Debug, Clone)]
pub struct LowRankLinear {
    core: LowRankCore,
}

impl LowRankLinear {
    /// Factorize a dense layer
    pub fn from_dense(
        name: &str,
        dense: &Linear,
        config: &LowRankConfig,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let bias = dense.bias().map(|b| b.data().to_vec());
        let core = LowRankCore::new(
            name,
            LayerKind::Linear,
            dense.n_in(),
            dense.n_out(),
            &dense.weight().data().to_vec(),
            bias.as_deref(),
            config,
            rng,
        )?;
        Ok(Self { core })
    }

    pub fn forward(&self, x: &Tensor, ctx: &Context) -> Result<Tensor> {
        let rows = rows_of(x, self.core.n_in())?;
        self.core.forward_rows(x, rows, ctx)
    }

    /// Dense layer with the current effective weight
    pub fn to_dense(&self) -> Result<Linear> {
        Linear::from_weights(
            self.core.n_in(),
            self.core.n_out(),
            to_row_major(&self.core.effective_weight()),
            self.core.bias().map(|b| b.data().to_vec()),
        )
    }
}

impl LowRankUnit for LowRankLinear {
    fn core(&self) -> &LowRankCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut LowRankCore {
        &mut self.core
    }
}
