//! Mixed-precision training utilities
//!
//! Activations are rounded through fp16/bf16 on the forward pass while
//! parameters and optimizer state stay in fp32. The [`GradScaler`] multiplies
//! the loss gradient before backward so small gradients survive the reduced
//! precision, then unscales and checks them before the optimizer step.

use super::Tensor;
use half::{bf16, f16};
use std::fmt;

/// Data type precision levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Precision {
    /// 32-bit floating point (default)
    #[default]
    Fp32,
    /// 16-bit floating point (IEEE half precision)
    Fp16,
    /// 16-bit brain floating point
    Bf16,
}

impl Precision {
    /// Human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            Precision::Fp32 => "fp32",
            Precision::Fp16 => "fp16",
            Precision::Bf16 => "bf16",
        }
    }

    /// Whether this is a reduced precision type
    pub fn is_reduced(&self) -> bool {
        matches!(self, Precision::Fp16 | Precision::Bf16)
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Round an f32 through `precision` and back
pub fn round_to_precision(value: f32, precision: Precision) -> f32 {
    match precision {
        Precision::Fp32 => value,
        Precision::Fp16 => f16::from_f32(value).to_f32(),
        Precision::Bf16 => bf16::from_f32(value).to_f32(),
    }
}

/// Configuration for mixed-precision training
#[derive(Debug, Clone)]
pub struct MixedPrecisionConfig {
    /// Precision for activations
    pub compute_precision: Precision,
    /// Initial loss scale factor
    pub initial_scale: f32,
    /// Factor to increase scale by after `scale_growth_interval` clean steps
    pub scale_growth_factor: f32,
    /// Factor to decrease scale by on overflow
    pub scale_backoff_factor: f32,
    /// Number of successful steps before increasing scale
    pub scale_growth_interval: usize,
    /// Whether to use dynamic loss scaling
    pub dynamic_scaling: bool,
}

impl MixedPrecisionConfig {
    /// Plain fp32 (no mixed precision)
    pub fn fp32() -> Self {
        Self {
            compute_precision: Precision::Fp32,
            initial_scale: 1.0,
            scale_growth_factor: 2.0,
            scale_backoff_factor: 0.5,
            scale_growth_interval: 2000,
            dynamic_scaling: false,
        }
    }

    /// fp16 autocast with dynamic loss scaling
    pub fn fp16() -> Self {
        Self {
            compute_precision: Precision::Fp16,
            initial_scale: 65536.0, // 2^16
            dynamic_scaling: true,
            ..Self::fp32()
        }
    }

    /// bf16 autocast; same exponent range as fp32 so no scaling
    pub fn bf16() -> Self {
        Self {
            compute_precision: Precision::Bf16,
            ..Self::fp32()
        }
    }

    /// Check if mixed precision is enabled
    pub fn is_mixed(&self) -> bool {
        self.compute_precision.is_reduced()
    }

    /// Set initial loss scale
    pub fn with_initial_scale(mut self, scale: f32) -> Self {
        self.initial_scale = scale;
        self
    }
}

impl Default for MixedPrecisionConfig {
    fn default() -> Self {
        Self::fp32()
    }
}

/// Dynamic loss scaler
#[derive(Debug, Clone)]
pub struct GradScaler {
    scale: f32,
    growth_factor: f32,
    backoff_factor: f32,
    growth_interval: usize,
    steps_since_growth: usize,
    dynamic: bool,
    overflow_count: usize,
}

impl GradScaler {
    /// Create a new gradient scaler
    pub fn new(initial_scale: f32) -> Self {
        Self::from_config(&MixedPrecisionConfig::fp16().with_initial_scale(initial_scale))
    }

    /// Create from config
    pub fn from_config(config: &MixedPrecisionConfig) -> Self {
        Self {
            scale: config.initial_scale,
            growth_factor: config.scale_growth_factor,
            backoff_factor: config.scale_backoff_factor,
            growth_interval: config.scale_growth_interval,
            steps_since_growth: 0,
            dynamic: config.dynamic_scaling,
            overflow_count: 0,
        }
    }

    /// Current scale
    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Divide every gradient by the scale
    ///
    /// Returns `false` if any gradient is non-finite after unscaling.
    pub fn unscale_and_check(&self, params: &[&mut Tensor]) -> bool {
        let inv_scale = 1.0 / self.scale;
        let mut valid = true;

        for param in params {
            if let Some(grad) = param.grad() {
                let unscaled = grad.mapv(|g| g * inv_scale);
                valid &= unscaled.iter().all(|g| g.is_finite());
                param.set_grad(unscaled);
            }
        }

        valid
    }

    /// Update the scale after a step; pass `true` if gradients were valid
    pub fn update(&mut self, grads_valid: bool) {
        if !self.dynamic {
            return;
        }

        if grads_valid {
            self.steps_since_growth += 1;
            if self.steps_since_growth >= self.growth_interval {
                self.scale *= self.growth_factor;
                self.steps_since_growth = 0;
            }
        } else {
            self.overflow_count += 1;
            self.scale = (self.scale * self.backoff_factor).max(1.0);
            self.steps_since_growth = 0;
        }
    }

    /// Number of overflowing steps seen so far
    pub fn overflow_count(&self) -> usize {
        self.overflow_count
    }
}

impl Default for GradScaler {
    fn default() -> Self {
        Self::new(65536.0)
    }
}
