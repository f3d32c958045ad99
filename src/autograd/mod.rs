//! Tape-based autograd engine
//!
//! Provides automatic differentiation using a computational graph with gradient tape.

mod backward;
mod context;
mod ops;
pub mod precision;
mod tensor;


pub use backward::BackwardOp;
pub use context::Context;
pub use ops::*;
pub use precision::{GradScaler, MixedPrecisionConfig, Precision};
pub use tensor::Tensor;

use std::collections::HashSet;

/// Perform backward pass on a tensor
///
/// Seeds the tensor's gradient with `grad_output` (ones when `None`) and runs
/// every op of the graph exactly once, consumers before producers, so a node
/// used several times has its gradient fully accumulated before it propagates.
pub fn backward(tensor: &mut Tensor, grad_output: Option<ndarray::Array1<f32>>) {
    let grad = grad_output.unwrap_or_else(|| ndarray::Array1::ones(tensor.len()));
    tensor.set_grad(grad);

    for node in topological_order(tensor).iter().rev() {
        if let Some(op) = node.backward_op() {
            op.backward();
        }
    }
}

/// Post-order over the graph reachable from `root` (inputs before outputs)
fn topological_order(root: &Tensor) -> Vec<Tensor> {
    let mut order = Vec::new();
    let mut visited = HashSet::new();
    // (node, inputs already pushed)
    let mut stack = vec![(root.clone(), false)];

    while let Some((node, expanded)) = stack.pop() {
        if expanded {
            order.push(node);
            continue;
        }
        if !visited.insert(node.node_id()) {
            continue;
        }
        let inputs = node
            .backward_op()
            .map(|op| op.inputs())
            .unwrap_or_default();
        stack.push((node, true));
        for input in inputs {
            if !visited.contains(&input.node_id()) {
                stack.push((input, false));
            }
        }
    }

    order
}
