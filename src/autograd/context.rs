//! Execution context threaded through every forward pass

use super::{Precision, Tensor};
use crate::lowrank::Phase;

/// Session state read by layers during forward
///
/// Holds the training phase so low-rank layers pick their K/L/S forward
/// without any global state.
#[derive(Debug, Clone)]
pub struct Context {
    training: bool,
    grad_enabled: bool,
    phase: Phase,
    precision: Precision,
}

impl Context {
    /// Create a new context (training mode, gradients on, phase S, fp32)
    pub fn new() -> Self {
        Self {
            training: true,
            grad_enabled: true,
            phase: Phase::S,
            precision: Precision::Fp32,
        }
    }

    /// Set training mode
    pub fn train(&mut self) {
        self.training = true;
    }

    /// Set evaluation mode
    pub fn eval(&mut self) {
        self.training = false;
    }

    /// Check if in training mode
    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Current training phase
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Select the training phase
    pub fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    /// Whether forward passes should record the graph
    pub fn grad_enabled(&self) -> bool {
        self.grad_enabled
    }

    /// Enable or disable graph recording
    pub fn set_grad_enabled(&mut self, enabled: bool) {
        self.grad_enabled = enabled;
    }

    /// A parameter as the graph should see it: itself, or a detached copy
    /// while graph recording is off
    pub fn track(&self, param: &Tensor) -> Tensor {
        if self.grad_enabled {
            param.clone()
        } else {
            param.detach()
        }
    }

    /// Activation precision
    pub fn precision(&self) -> Precision {
        self.precision
    }

    /// Set activation precision
    pub fn set_precision(&mut self, precision: Precision) {
        self.precision = precision;
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
