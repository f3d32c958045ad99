//! YAML schema definitions for declarative DLRT configuration

use crate::lowrank::InitMethod;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Complete training specification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlrtSpec {
    /// Optimizer configuration
    pub optimizer: OptimSpec,

    /// Low-rank factorization and adaptation
    #[serde(default)]
    pub dlrt: DlrtParams,

    /// Training hyperparameters
    #[serde(default)]
    pub training: TrainingParams,
}

/// Optimizer specification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimSpec {
    /// Optimizer name: "adam" | "adamw" | "sgd"
    pub name: String,

    /// Learning rate (required)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lr: Option<f32>,

    /// Optimizer-specific parameters (beta1, beta2, momentum, etc.)
    #[serde(flatten)]
    pub params: HashMap<String, serde_json::Value>,
}

/// Low-rank settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlrtParams {
    /// Mapping of layer kind (`linear`, `conv2d`) to truncation threshold
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epsilon: Option<serde_json::Value>,

    /// Rank cap as a fraction of `min(n_in, n_out)`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank_percent: Option<f32>,

    #[serde(default = "default_true")]
    pub adaptive: bool,

    #[serde(default)]
    pub mixed_precision: bool,

    #[serde(default)]
    pub init_method: InitMethod,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_rank: Option<usize>,

    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Keep the last factorizable layer dense
    #[serde(default = "default_true")]
    pub dense_last_layer: bool,
}

impl Default for DlrtParams {
    fn default() -> Self {
        Self {
            epsilon: None,
            rank_percent: None,
            adaptive: true,
            mixed_precision: false,
            init_method: InitMethod::default(),
            initial_rank: None,
            seed: default_seed(),
            dense_last_layer: true,
        }
    }
}

/// Training hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingParams {
    /// Number of epochs
    #[serde(default = "default_epochs")]
    pub epochs: usize,

    /// Log loss and ranks every N steps
    #[serde(default = "default_log_interval")]
    pub log_interval: usize,

    /// Gradient clipping threshold under mixed precision
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grad_clip: Option<f32>,

    /// Learning rate scheduler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lr_scheduler: Option<SchedulerSpec>,
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            log_interval: default_log_interval(),
            grad_clip: None,
            lr_scheduler: None,
        }
    }
}

/// Learning rate scheduler specification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSpec {
    /// Scheduler name: "cosine" | "step"
    pub name: String,

    /// Scheduler-specific parameters (lr_min, step_size, gamma)
    #[serde(flatten)]
    pub params: HashMap<String, serde_json::Value>,
}

fn default_true() -> bool {
    true
}

fn default_seed() -> u64 {
    42
}

fn default_epochs() -> usize {
    10
}

fn default_log_interval() -> usize {
    100
}
