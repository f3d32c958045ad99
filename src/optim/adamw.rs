//! AdamW optimizer (Adam with decoupled Weight decay)

use super::adam::Moments;
use super::optimizer::state_slot;
use super::Optimizer;
use crate::Tensor;

/// AdamW optimizer
///
/// Standard Adam with L2: θ_t = θ_{t-1} - lr * (m_t / (√v_t + ε) + λ * θ_{t-1})
/// AdamW: θ_t = (1 - lr * λ) * θ_{t-1} - lr * m_t / (√v_t + ε)
pub struct AdamW {
    lr: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    weight_decay: f32,
    state: Vec<Option<Moments>>,
}

impl AdamW {
    /// Create a new AdamW optimizer
    pub fn new(lr: f32, beta1: f32, beta2: f32, epsilon: f32, weight_decay: f32) -> Self {
        Self {
            lr,
            beta1,
            beta2,
            epsilon,
            weight_decay,
            state: Vec::new(),
        }
    }

    /// Create AdamW with default parameters (weight_decay = 0.01)
    pub fn default_params(lr: f32) -> Self {
        Self::new(lr, 0.9, 0.999, 1e-8, 0.01)
    }
}

impl Optimizer for AdamW {
    fn step_refs(&mut self, params: &mut [&mut Tensor]) {
        for (i, param) in params.iter_mut().enumerate() {
            let Some(grad) = param.grad() else {
                continue;
            };
            let slot = state_slot(&mut self.state, i, grad.len(), |s| s.m.len());
            let direction = Moments::update(slot, &grad, self.beta1, self.beta2, self.epsilon);

            // Weight decay is applied to the parameters, not the gradient
            let weight_decay_factor = 1.0 - self.lr * self.weight_decay;
            *param.data_mut() = param.data() * weight_decay_factor - &(direction * self.lr);
        }
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }
}
