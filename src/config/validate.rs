//! Configuration validation

use super::schema::DlrtSpec;
use crate::error::Error;
use crate::lowrank::EpsilonConfig;

/// Validation error type
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Optimizer configuration is missing a learning rate ('lr')")]
    MissingLearningRate,

    #[error("Invalid learning rate: {0} (must be > 0.0)")]
    InvalidLearningRate(f32),

    #[error("Invalid optimizer: {0} (must be one of: adam, adamw, sgd)")]
    InvalidOptimizer(String),

    #[error("Invalid epochs: {0} (must be > 0)")]
    InvalidEpochs(usize),

    #[error("Invalid log interval: {0} (must be > 0)")]
    InvalidLogInterval(usize),

    #[error("Invalid gradient clip value: {0} (must be > 0.0)")]
    InvalidGradClip(f32),

    #[error("Invalid rank_percent: {0} (must be in (0, 1])")]
    InvalidRankPercent(f32),

    #[error("Invalid epsilon: {0}")]
    InvalidEpsilon(String),

    #[error("Invalid scheduler: {0} (must be one of: cosine, step)")]
    InvalidScheduler(String),
}

impl From<ValidationError> for Error {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::MissingLearningRate => Error::MissingLearningRate,
            ValidationError::InvalidRankPercent(p) => Error::InvalidRankPercent(p),
            ValidationError::InvalidEpsilon(msg) => Error::InvalidEpsilon(msg),
            other => Error::ConfigError(other.to_string()),
        }
    }
}

/// Validate a training specification
///
/// Checks:
/// - Numeric values are in valid ranges
/// - Names match allowed values
/// - The epsilon mapping is well formed
pub fn validate_config(spec: &DlrtSpec) -> Result<(), ValidationError> {
    let lr = spec.optimizer.lr.ok_or(ValidationError::MissingLearningRate)?;
    if !(lr > 0.0) {
        return Err(ValidationError::InvalidLearningRate(lr));
    }

    let valid_optimizers = ["adam", "adamw", "sgd"];
    if !valid_optimizers.contains(&spec.optimizer.name.to_lowercase().as_str()) {
        return Err(ValidationError::InvalidOptimizer(
            spec.optimizer.name.clone(),
        ));
    }

    if spec.training.epochs == 0 {
        return Err(ValidationError::InvalidEpochs(spec.training.epochs));
    }

    if spec.training.log_interval == 0 {
        return Err(ValidationError::InvalidLogInterval(0));
    }

    if let Some(grad_clip) = spec.training.grad_clip {
        if !(grad_clip > 0.0) {
            return Err(ValidationError::InvalidGradClip(grad_clip));
        }
    }

    if let Some(p) = spec.dlrt.rank_percent {
        if !(p > 0.0 && p <= 1.0) {
            return Err(ValidationError::InvalidRankPercent(p));
        }
    }

    if let Some(eps) = &spec.dlrt.epsilon {
        EpsilonConfig::from_value(eps).map_err(|e| match e {
            Error::InvalidEpsilon(msg) => ValidationError::InvalidEpsilon(msg),
            other => ValidationError::InvalidEpsilon(other.to_string()),
        })?;
    }

    if let Some(scheduler) = &spec.training.lr_scheduler {
        let valid_schedulers = ["cosine", "step"];
        if !valid_schedulers.contains(&scheduler.name.to_lowercase().as_str()) {
            return Err(ValidationError::InvalidScheduler(scheduler.name.clone()));
        }
    }

    Ok(())
}
