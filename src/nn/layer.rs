//! The unit a model graph is built from

use super::{Conv2d, Linear};
use crate::autograd::{relu, Context};
use crate::error::{Error, Result};
use crate::lowrank::{LowRankConv2d, LowRankLinear, LowRankUnit};
use crate::Tensor;

/// A node's layer
///
/// Containers (`Sequential`, `Residual`) carry no state of their own; their
/// children live in the model arena.
#[derive(Debug, Clone)]
pub enum Layer {
    /// Children applied in order
    Sequential,
    /// Children applied in order, output added to the input
    Residual,
    Relu,
    /// `[B, ...] -> [B, rest]`
    Flatten,
    Linear(Linear),
    Conv2d(Conv2d),
    LowRankLinear(LowRankLinear),
    LowRankConv2d(LowRankConv2d),
}

impl Layer {
    /// Short type name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Layer::Sequential => "sequential",
            Layer::Residual => "residual",
            Layer::Relu => "relu",
            Layer::Flatten => "flatten",
            Layer::Linear(_) => "linear",
            Layer::Conv2d(_) => "conv2d",
            Layer::LowRankLinear(_) => "lowrank_linear",
            Layer::LowRankConv2d(_) => "lowrank_conv2d",
        }
    }

    pub fn is_container(&self) -> bool {
        matches!(self, Layer::Sequential | Layer::Residual)
    }

    /// Dense layers that can be factorized
    pub fn is_factorizable(&self) -> bool {
        matches!(self, Layer::Linear(_) | Layer::Conv2d(_))
    }

    /// The low-rank capability, if this layer has one
    pub fn as_low_rank(&self) -> Option<&dyn LowRankUnit> {
        match self {
            Layer::LowRankLinear(l) => Some(l),
            Layer::LowRankConv2d(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_low_rank_mut(&mut self) -> Option<&mut dyn LowRankUnit> {
        match self {
            Layer::LowRankLinear(l) => Some(l),
            Layer::LowRankConv2d(c) => Some(c),
            _ => None,
        }
    }

    /// Forward through a leaf layer
    ///
    /// Containers are evaluated by the model, which owns their children.
    pub fn forward(&self, x: &Tensor, ctx: &Context) -> Result<Tensor> {
        match self {
            Layer::Sequential | Layer::Residual => Err(Error::ConfigError(format!(
                "{} layers are evaluated through their model",
                self.kind()
            ))),
            Layer::Relu => Ok(relu(x)),
            Layer::Flatten => {
                let batch = x.shape().first().copied().unwrap_or(1).max(1);
                Ok(x.reshape(&[batch, x.len() / batch]))
            }
            Layer::Linear(l) => l.forward(x, ctx),
            Layer::Conv2d(c) => c.forward(x, ctx),
            Layer::LowRankLinear(l) => l.forward(x, ctx),
            Layer::LowRankConv2d(c) => c.forward(x, ctx),
        }
    }

    pub fn parameters(&self) -> Vec<&Tensor> {
        match self {
            Layer::Linear(l) => l.parameters(),
            Layer::Conv2d(c) => c.parameters(),
            Layer::LowRankLinear(l) => l.core().parameters(),
            Layer::LowRankConv2d(c) => c.core().parameters(),
            _ => Vec::new(),
        }
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        match self {
            Layer::Linear(l) => l.parameters_mut(),
            Layer::Conv2d(c) => c.parameters_mut(),
            Layer::LowRankLinear(l) => l.core_mut().parameters_mut(),
            Layer::LowRankConv2d(c) => c.core_mut().parameters_mut(),
            _ => Vec::new(),
        }
    }
}

impl From<Linear> for Layer {
    fn from(layer: Linear) -> Self {
        Layer::Linear(layer)
    }
}

impl From<Conv2d> for Layer {
    fn from(layer: Conv2d) -> Self {
        Layer::Conv2d(layer)
    }
}
