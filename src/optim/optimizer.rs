//! Optimizer trait

use crate::Tensor;

/// Trait for optimization algorithms
///
/// Optimizers keep per-parameter state by position, so callers must pass the
/// same parameters in the same order on every step. Parameters without a
/// gradient (frozen for the current phase) are skipped and keep their state.
pub trait Optimizer {
    /// Perform a single optimization step on borrowed parameters
    fn step_refs(&mut self, params: &mut [&mut Tensor]);

    /// Perform a single optimization step
    fn step(&mut self, params: &mut [Tensor]) {
        let mut refs: Vec<&mut Tensor> = params.iter_mut().collect();
        self.step_refs(&mut refs);
    }

    /// Zero out all gradients
    fn zero_grad(&mut self, params: &mut [Tensor]) {
        for param in params {
            param.zero_grad();
        }
    }

    /// Zero out gradients on borrowed parameters
    fn zero_grad_refs(&mut self, params: &mut [&mut Tensor]) {
        for param in params {
            param.zero_grad();
        }
    }

    /// Get learning rate
    fn lr(&self) -> f32;

    /// Set learning rate
    fn set_lr(&mut self, lr: f32);
}

/// Per-parameter state slot that resets when the parameter changes size
///
/// Low-rank factors are resized by rank adaptation; stale moments of the old
/// shape are dropped instead of being broadcast against the new gradient.
pub(crate) fn state_slot<T>(
    state: &mut Vec<Option<T>>,
    index: usize,
    len: usize,
    state_len: impl Fn(&T) -> usize,
) -> &mut Option<T> {
    if state.len() <= index {
        state.resize_with(index + 1, || None);
    }
    let slot = &mut state[index];
    if slot.as_ref().is_some_and(|s| state_len(s) != len) {
        *slot = None;
    }
    slot
}
