//! Adam optimizer

use super::optimizer::state_slot;
use super::Optimizer;
use crate::Tensor;
use ndarray::Array1;

/// First and second moments of one parameter
pub(crate) struct Moments {
    pub(crate) m: Array1<f32>,
    pub(crate) v: Array1<f32>,
    pub(crate) t: i32,
}

impl Moments {
    /// Advance the moments with `grad` and return the bias-corrected step
    /// direction `m̂ / (√v̂ + ε)`
    pub(crate) fn update(
        slot: &mut Option<Moments>,
        grad: &Array1<f32>,
        beta1: f32,
        beta2: f32,
        epsilon: f32,
    ) -> Array1<f32> {
        let state = slot.get_or_insert_with(|| Moments {
            m: Array1::zeros(grad.len()),
            v: Array1::zeros(grad.len()),
            t: 0,
        });
        state.t += 1;

        // m_t = β1 * m_{t-1} + (1 - β1) * g
        state.m = &state.m * beta1 + grad * (1.0 - beta1);
        // v_t = β2 * v_{t-1} + (1 - β2) * g²
        state.v = &state.v * beta2 + &(grad * grad) * (1.0 - beta2);

        let m_hat = &state.m / (1.0 - beta1.powi(state.t));
        let v_hat = &state.v / (1.0 - beta2.powi(state.t));
        m_hat / (v_hat.mapv(f32::sqrt) + epsilon)
    }
}

/// Adam optimizer (Adaptive Moment Estimation)
///
/// Step counts are kept per parameter: K, L and S factors are each updated in
/// only one of the three phases of a training step.
pub struct Adam {
    lr: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    state: Vec<Option<Moments>>,
}

impl Adam {
    /// Create a new Adam optimizer
    pub fn new(lr: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            lr,
            beta1,
            beta2,
            epsilon,
            state: Vec::new(),
        }
    }

    /// Create Adam with default parameters
    pub fn default_params(lr: f32) -> Self {
        Self::new(lr, 0.9, 0.999, 1e-8)
    }
}

impl Optimizer for Adam {
    fn step_refs(&mut self, params: &mut [&mut Tensor]) {
        for (i, param) in params.iter_mut().enumerate() {
            let Some(grad) = param.grad() else {
                continue;
            };
            let slot = state_slot(&mut self.state, i, grad.len(), |s| s.m.len());
            let direction = Moments::update(slot, &grad, self.beta1, self.beta2, self.epsilon);

            // θ_t = θ_{t-1} - lr * m̂_t / (√v̂_t + ε)
            *param.data_mut() = param.data() - &(direction * self.lr);
        }
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }
}
