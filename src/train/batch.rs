//! Batch data structure

use crate::Tensor;

/// A training batch containing inputs and targets
#[derive(Debug, Clone)]
pub struct Batch {
    /// Input features, `[B, ...]`
    pub inputs: Tensor,
    /// Regression targets, or class indices stored as `f32`
    pub targets: Tensor,
}

impl Batch {
    /// Create a new batch
    pub fn new(inputs: Tensor, targets: Tensor) -> Self {
        Self { inputs, targets }
    }

    /// Number of examples (leading input dimension)
    pub fn size(&self) -> usize {
        self.inputs.shape().first().copied().unwrap_or(0)
    }
}
