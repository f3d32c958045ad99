//! Trainer configuration

use crate::autograd::MixedPrecisionConfig;
use crate::error::Result;
use crate::lowrank::LowRankConfig;

/// Configuration of a [`DlrtTrainer`](super::DlrtTrainer)
#[derive(Clone, Debug)]
pub struct DlrtConfig {
    /// Factorization and rank adaptation settings
    pub low_rank: LowRankConfig,

    /// Simulated fp16 autocast with loss scaling
    pub mixed_precision: bool,

    /// Global gradient norm bound applied under mixed precision
    pub max_grad_norm: f32,

    /// Log step loss and layer ranks every N steps
    pub log_interval: usize,

    /// Keep the last factorizable layer dense
    pub dense_last_layer: bool,
}

impl Default for DlrtConfig {
    fn default() -> Self {
        Self {
            low_rank: LowRankConfig::default(),
            mixed_precision: false,
            max_grad_norm: 0.1,
            log_interval: 100,
            dense_last_layer: true,
        }
    }
}

impl DlrtConfig {
    /// Create a new trainer configuration
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_low_rank(mut self, low_rank: LowRankConfig) -> Self {
        self.low_rank = low_rank;
        self
    }

    pub fn with_mixed_precision(mut self, enabled: bool) -> Self {
        self.mixed_precision = enabled;
        self
    }

    /// Set gradient clipping norm
    pub fn with_grad_clip(mut self, max_norm: f32) -> Self {
        self.max_grad_norm = max_norm;
        self
    }

    /// Set logging interval
    pub fn with_log_interval(mut self, interval: usize) -> Self {
        self.log_interval = interval.max(1);
        self
    }

    pub fn with_dense_last_layer(mut self, enabled: bool) -> Self {
        self.dense_last_layer = enabled;
        self
    }

    /// Loss scaling settings implied by `mixed_precision`
    pub fn precision(&self) -> MixedPrecisionConfig {
        if self.mixed_precision {
            MixedPrecisionConfig::fp16()
        } else {
            MixedPrecisionConfig::fp32()
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.low_rank.validate()
    }
}
