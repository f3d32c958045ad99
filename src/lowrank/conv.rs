//! Low-rank replacement for a dense convolution

use super::config::{LayerKind, LowRankConfig};
use super::linalg::to_row_major;
use super::{LowRankCore, LowRankUnit};
use crate::autograd::{rows_to_nchw, Context, ConvGeometry};
use crate::error::Result;
use crate::nn::conv::unfold;
use crate::nn::Conv2d;
use crate::Tensor;
use rand::rngs::StdRng;

/// Convolution whose `[C·kh·kw, C_out]` kernel matrix is factorized
#[derive(Debug, Clone)]
pub struct LowRankConv2d {
    geometry: ConvGeometry,
    core: LowRankCore,
}

impl LowRankConv2d {
    /// Factorize a dense convolution
    pub fn from_dense(
        name: &str,
        dense: &Conv2d,
        config: &LowRankConfig,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let geometry = dense.geometry();
        let bias = dense.bias().map(|b| b.data().to_vec());
        let core = LowRankCore::new(
            name,
            LayerKind::Conv2d,
            geometry.patch_len(),
            dense.out_channels(),
            &dense.weight().data().to_vec(),
            bias.as_deref(),
            config,
            rng,
        )?;
        Ok(Self { geometry, core })
    }

    pub fn geometry(&self) -> ConvGeometry {
        self.geometry
    }

    pub fn forward(&self, x: &Tensor, ctx: &Context) -> Result<Tensor> {
        let (cols, (batch, oh, ow)) = unfold(x, self.geometry)?;
        let y = self.core.forward_rows(&cols, batch * oh * ow, ctx)?;
        Ok(rows_to_nchw(&y, batch, self.core.n_out(), oh, ow))
    }

    /// Dense convolution with the current effective kernel
    pub fn to_dense(&self) -> Result<Conv2d> {
        Conv2d::from_weights(
            self.geometry,
            self.core.n_out(),
            to_row_major(&self.core.effective_weight()),
            self.core.bias().map(|b| b.data().to_vec()),
        )
    }
}

impl LowRankUnit for LowRankConv2d {
    fn core(&self) -> &LowRankCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut LowRankCore {
        &mut self.core
    }
}
