//! Backward operation trait

use super::Tensor;

/// Trait for backward pass operations
///
/// `backward` only computes the local vector-Jacobian product and accumulates
/// it into the inputs; graph traversal order is owned by [`super::backward`].
pub trait BackwardOp {
    /// Perform backward pass
    fn backward(&self);

    /// Tensors this op read during the forward pass
    fn inputs(&self) -> Vec<Tensor>;
}
