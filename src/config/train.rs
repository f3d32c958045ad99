//! Trainer construction from YAML configuration

use super::builder::{build_optimizer, build_scheduler};
use super::schema::DlrtSpec;
use super::validate::validate_config;
use crate::error::{Error, Result};
use crate::model::Model;
use crate::train::{DlrtConfig, DlrtTrainer, LossFn};
use std::fs;
use std::path::Path;
use tracing::info;

/// Load and validate a DLRT spec from a YAML file
///
/// Validation failures keep their specific error kind, so a missing `lr`
/// surfaces as [`Error::MissingLearningRate`].
pub fn load_config<P: AsRef<Path>>(config_path: P) -> Result<DlrtSpec> {
    let yaml_content = fs::read_to_string(config_path.as_ref()).map_err(|e| {
        Error::ConfigError(format!(
            "Failed to read config file {}: {}",
            config_path.as_ref().display(),
            e
        ))
    })?;

    parse_config(&yaml_content)
}

/// Parse and validate a DLRT spec from YAML text
pub fn parse_config(yaml: &str) -> Result<DlrtSpec> {
    let spec: DlrtSpec = serde_yaml::from_str(yaml)
        .map_err(|e| Error::ConfigError(format!("Failed to parse YAML config: {}", e)))?;

    validate_config(&spec)?;

    Ok(spec)
}

/// Build a ready-to-train [`DlrtTrainer`] from a validated spec
///
/// # Example
///
/// ```no_run
/// use rango::config::{build_trainer, load_config};
/// use rango::model::Model;
/// use rango::nn::Linear;
/// use rango::train::MSELoss;
/// use rand::rngs::StdRng;
/// use rand::SeedableRng;
///
/// let mut rng = StdRng::seed_from_u64(0);
/// let spec = load_config("dlrt.yaml")?;
/// let mut model = Model::sequential();
/// let root = model.root();
/// model.push(root, "fc", Linear::new(10, 10, true, &mut rng))?;
/// let trainer = build_trainer(&spec, &model, Box::new(MSELoss))?;
/// # Ok::<(), rango::Error>(())
/// ```
pub fn build_trainer(
    spec: &DlrtSpec,
    model: &Model,
    loss_fn: Box<dyn LossFn>,
) -> Result<DlrtTrainer> {
    validate_config(spec)?;
    let optimizer = build_optimizer(&spec.optimizer)?;
    let config = DlrtConfig::try_from(spec)?;
    let base_lr = optimizer.lr();

    let mut trainer = DlrtTrainer::new(model, optimizer, loss_fn, config)?;
    if let Some(scheduler) = &spec.training.lr_scheduler {
        trainer = trainer.with_scheduler(build_scheduler(
            scheduler,
            base_lr,
            spec.training.epochs,
        )?);
    }

    info!(
        optimizer = %spec.optimizer.name,
        lr = base_lr,
        epochs = spec.training.epochs,
        "trainer built from config"
    );
    Ok(trainer)
}
