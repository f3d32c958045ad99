//! Build training components from configuration

use super::schema::{DlrtParams, DlrtSpec, OptimSpec, SchedulerSpec};
use crate::error::{Error, Result};
use crate::lowrank::{EpsilonConfig, LowRankConfig};
use crate::optim::{Adam, AdamW, CosineAnnealingLR, LRScheduler, Optimizer, StepLR, SGD};
use crate::train::DlrtConfig;
use std::collections::HashMap;

fn param_f32(params: &HashMap<String, serde_json::Value>, key: &str, default: f32) -> f32 {
    params
        .get(key)
        .and_then(|v| v.as_f64())
        .map(|v| v as f32)
        .unwrap_or(default)
}

/// Build optimizer from configuration
///
/// The learning rate is required; every other parameter has a default.
pub fn build_optimizer(spec: &OptimSpec) -> Result<Box<dyn Optimizer>> {
    let lr = spec.lr.ok_or(Error::MissingLearningRate)?;
    let params = &spec.params;

    match spec.name.to_lowercase().as_str() {
        "sgd" => Ok(Box::new(SGD::new(lr, param_f32(params, "momentum", 0.0)))),
        "adam" => Ok(Box::new(Adam::new(
            lr,
            param_f32(params, "beta1", 0.9),
            param_f32(params, "beta2", 0.999),
            param_f32(params, "eps", 1e-8),
        ))),
        "adamw" => Ok(Box::new(AdamW::new(
            lr,
            param_f32(params, "beta1", 0.9),
            param_f32(params, "beta2", 0.999),
            param_f32(params, "eps", 1e-8),
            param_f32(params, "weight_decay", 0.01),
        ))),
        name => Err(Error::ConfigError(format!(
            "Unknown optimizer: {}. Supported: sgd, adam, adamw",
            name
        ))),
    }
}

/// Build a learning rate scheduler stepped once per epoch
pub fn build_scheduler(
    spec: &SchedulerSpec,
    base_lr: f32,
    epochs: usize,
) -> Result<Box<dyn LRScheduler>> {
    let params = &spec.params;
    match spec.name.to_lowercase().as_str() {
        "cosine" => Ok(Box::new(CosineAnnealingLR::new(
            base_lr,
            epochs.max(1),
            param_f32(params, "lr_min", 0.0),
        ))),
        "step" => {
            let step_size = params
                .get("step_size")
                .and_then(|v| v.as_u64())
                .unwrap_or(1) as usize;
            Ok(Box::new(StepLR::new(
                base_lr,
                step_size,
                param_f32(params, "gamma", 0.1),
            )))
        }
        name => Err(Error::ConfigError(format!(
            "Unknown scheduler: {}. Supported: cosine, step",
            name
        ))),
    }
}

/// Low-rank settings from the `dlrt` section
pub fn build_low_rank_config(params: &DlrtParams) -> Result<LowRankConfig> {
    let epsilon = match &params.epsilon {
        Some(value) => EpsilonConfig::from_value(value)?,
        None => EpsilonConfig::default(),
    };
    let mut config = LowRankConfig::new()
        .with_epsilon(epsilon)
        .with_adaptive(params.adaptive)
        .with_init_method(params.init_method)
        .with_seed(params.seed);
    if let Some(p) = params.rank_percent {
        config = config.with_rank_percent(p);
    }
    if let Some(r) = params.initial_rank {
        config = config.with_initial_rank(r);
    }
    config.validate()?;
    Ok(config)
}

impl TryFrom<&DlrtSpec> for DlrtConfig {
    type Error = Error;

    fn try_from(spec: &DlrtSpec) -> Result<Self> {
        let mut config = DlrtConfig::new()
            .with_low_rank(build_low_rank_config(&spec.dlrt)?)
            .with_mixed_precision(spec.dlrt.mixed_precision)
            .with_log_interval(spec.training.log_interval)
            .with_dense_last_layer(spec.dlrt.dense_last_layer);
        if let Some(clip) = spec.training.grad_clip {
            config = config.with_grad_clip(clip);
        }
        Ok(config)
    }
}
