//! Loss functions for training

use crate::autograd::BackwardOp;
use crate::error::{Error, Result};
use crate::Tensor;
use ndarray::Array1;
use std::cell::RefCell;
use std::rc::Rc;

type GradCell = Rc<RefCell<Option<Array1<f32>>>>;

/// Trait for loss functions
pub trait LossFn {
    /// Scalar loss of `predictions` against `targets`
    ///
    /// The returned tensor is wired into the graph when `predictions`
    /// requires a gradient.
    fn forward(&self, predictions: &Tensor, targets: &Tensor) -> Result<Tensor>;

    /// Name of the loss function
    fn name(&self) -> &str;
}

/// Scalar loss with a precomputed local gradient `∂L/∂predictions`
///
/// The gradient is scaled by the loss's own upstream gradient, so a scaled
/// seed (mixed precision) reaches the model scaled.
fn scalar_loss(value: f32, predictions: &Tensor, local_grad: Array1<f32>) -> Tensor {
    let mut loss = Tensor::from_vec(vec![value], predictions.requires_grad());
    if predictions.requires_grad() {
        loss.set_backward_op(Rc::new(LossBackward {
            predictions: predictions.clone(),
            loss_grad: loss.grad_cell(),
            local_grad,
        }));
    }
    loss
}

struct LossBackward {
    predictions: Tensor,
    loss_grad: GradCell,
    local_grad: Array1<f32>,
}

impl BackwardOp for LossBackward {
    fn backward(&self) {
        if let Some(grad) = self.loss_grad.borrow().as_ref() {
            self.predictions.accumulate_grad(&self.local_grad * grad[0]);
        }
    }

    fn inputs(&self) -> Vec<Tensor> {
        vec![self.predictions.clone()]
    }
}

/// Mean Squared Error Loss
///
/// L = mean((predictions - targets)²)
///
/// # Example
///
/// ```
/// use rango::train::{MSELoss, LossFn};
/// use rango::Tensor;
///
/// let loss_fn = MSELoss;
/// let pred = Tensor::from_vec(vec![1.0, 2.0, 3.0], true);
/// let target = Tensor::from_vec(vec![1.5, 2.5, 3.5], false);
///
/// let loss = loss_fn.forward(&pred, &target).unwrap();
/// assert!(loss.data()[0] > 0.0);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct MSELoss;

impl LossFn for MSELoss {
    fn forward(&self, predictions: &Tensor, targets: &Tensor) -> Result<Tensor> {
        if predictions.len() != targets.len() || predictions.is_empty() {
            return Err(Error::ShapeMismatch {
                expected: predictions.shape().to_vec(),
                got: targets.shape().to_vec(),
            });
        }

        let diff = predictions.data() - targets.data();
        let mse = diff.mapv(|d| d * d).mean().unwrap_or(0.0);

        // d(MSE)/d(pred) = 2 * (pred - target) / n
        let n = predictions.len() as f32;
        Ok(scalar_loss(mse, predictions, diff * (2.0 / n)))
    }

    fn name(&self) -> &str {
        "MSE"
    }
}

/// Cross entropy over `[B, classes]` logits with class-index targets
///
/// L = mean_b(-log softmax(logits_b)[target_b])
///
/// # Example
///
/// ```
/// use rango::train::{CrossEntropyLoss, LossFn};
/// use rango::Tensor;
///
/// let loss_fn = CrossEntropyLoss::new(3);
/// let logits = Tensor::from_shape(vec![2.0, 1.0, 0.5], &[1, 3], true);
/// let targets = Tensor::from_vec(vec![0.0], false);
///
/// let loss = loss_fn.forward(&logits, &targets).unwrap();
/// assert!(loss.data()[0] > 0.0);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct CrossEntropyLoss {
    classes: usize,
}

impl CrossEntropyLoss {
    pub fn new(classes: usize) -> Self {
        Self { classes }
    }

    pub fn classes(&self) -> usize {
        self.classes
    }

    /// Compute softmax: exp(x_i) / sum(exp(x_j))
    fn softmax(x: &[f32]) -> Vec<f32> {
        let max = x.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        let exp_x: Vec<f32> = x.iter().map(|v| (v - max).exp()).collect();
        let sum: f32 = exp_x.iter().sum();
        exp_x.into_iter().map(|e| e / sum).collect()
    }
}

impl LossFn for CrossEntropyLoss {
    fn forward(&self, predictions: &Tensor, targets: &Tensor) -> Result<Tensor> {
        let batch = targets.len();
        if self.classes == 0 || batch == 0 || predictions.len() != batch * self.classes {
            return Err(Error::ShapeMismatch {
                expected: vec![batch, self.classes],
                got: predictions.shape().to_vec(),
            });
        }
        let logits = predictions.data().as_slice().ok_or_else(|| {
            Error::ShapeMismatch {
                expected: vec![batch, self.classes],
                got: predictions.shape().to_vec(),
            }
        })?;

        let mut total = 0.0;
        let mut grad = Vec::with_capacity(predictions.len());
        for (row, &target) in logits.chunks(self.classes).zip(targets.data().iter()) {
            let class = target as usize;
            if target < 0.0 || class >= self.classes || target.fract() != 0.0 {
                return Err(Error::ConfigError(format!(
                    "class index {target} outside 0..{}",
                    self.classes
                )));
            }
            let probs = Self::softmax(row);
            total -= (probs[class] + 1e-10).ln();
            // d(CE)/d(logits) = (probs - onehot) / B
            grad.extend(probs.iter().enumerate().map(|(j, &p)| {
                let onehot = if j == class { 1.0 } else { 0.0 };
                (p - onehot) / batch as f32
            }));
        }

        Ok(scalar_loss(
            total / batch as f32,
            predictions,
            Array1::from_vec(grad),
        ))
    }

    fn name(&self) -> &str {
        "CrossEntropy"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::backward;
    use approx::assert_relative_eq;

    #[test]
    fn test_mse_loss_basic() {
        let pred = Tensor::from_vec(vec![1.0, 2.0, 3.0], true);
        let target = Tensor::from_vec(vec![1.5, 2.5, 3.5], false);

        let loss = MSELoss.forward(&pred, &target).unwrap();

        // MSE = mean((0.5, 0.5, 0.5)^2) = 0.25
        assert_relative_eq!(loss.data()[0], 0.25, epsilon = 1e-5);
    }

    #[test]
    fn test_mse_gradient() {
        let pred = Tensor::from_vec(vec![1.0, 2.0, 3.0], true);
        let target = Tensor::from_vec(vec![0.0, 0.0, 0.0], false);

        let mut loss = MSELoss.forward(&pred, &target).unwrap();
        backward(&mut loss, None);

        let grad = pred.grad().unwrap();
        assert_relative_eq!(grad[0], 2.0 / 3.0, epsilon = 1e-5);
        assert_relative_eq!(grad[1], 4.0 / 3.0, epsilon = 1e-5);
        assert_relative_eq!(grad[2], 6.0 / 3.0, epsilon = 1e-5);
    }

    #[test]
    fn test_scaled_seed_scales_gradient() {
        let pred = Tensor::from_vec(vec![1.0, -1.0], true);
        let target = Tensor::from_vec(vec![0.0, 0.0], false);

        let mut loss = MSELoss.forward(&pred, &target).unwrap();
        backward(&mut loss, Some(Array1::from_vec(vec![8.0])));

        // 8 · 2·(±1)/2
        assert_eq!(pred.grad().unwrap().to_vec(), vec![8.0, -8.0]);
    }

    #[test]
    fn test_mse_mismatched_lengths() {
        let pred = Tensor::from_vec(vec![1.0, 2.0], true);
        let target = Tensor::from_vec(vec![1.0, 2.0, 3.0], false);
        assert!(matches!(
            MSELoss.forward(&pred, &target),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_cross_entropy_uniform_logits() {
        let loss_fn = CrossEntropyLoss::new(4);
        let logits = Tensor::from_shape(vec![0.0; 8], &[2, 4], true);
        let targets = Tensor::from_vec(vec![1.0, 3.0], false);

        let mut loss = loss_fn.forward(&logits, &targets).unwrap();
        assert_relative_eq!(loss.data()[0], 4.0f32.ln(), epsilon = 1e-5);

        backward(&mut loss, None);
        let grad = logits.grad().unwrap();
        // (1/4 - 1)/2 at the target, (1/4)/2 elsewhere
        assert_relative_eq!(grad[1], -0.375, epsilon = 1e-6);
        assert_relative_eq!(grad[0], 0.125, epsilon = 1e-6);
        assert_relative_eq!(grad.sum(), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_cross_entropy_rejects_bad_labels() {
        let loss_fn = CrossEntropyLoss::new(3);
        let logits = Tensor::from_shape(vec![0.0; 3], &[1, 3], true);
        assert!(loss_fn
            .forward(&logits, &Tensor::from_vec(vec![3.0], false))
            .is_err());
        assert!(loss_fn
            .forward(&logits, &Tensor::from_vec(vec![0.0, 1.0], false))
            .is_err());
    }

    #[test]
    fn test_softmax() {
        let probs = CrossEntropyLoss::softmax(&[1.0, 2.0, 3.0]);

        let sum: f32 = probs.iter().sum();
        assert_relative_eq!(sum, 1.0, epsilon = 1e-5);
        assert!(probs.iter().all(|&p| (0.0..=1.0).contains(&p)));
    }
}
