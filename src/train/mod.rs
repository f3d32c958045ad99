//! Dynamic low-rank training loop
//!
//! This module provides:
//! - [`DlrtTrainer`]: the K → L → S phase controller with rank adaptation
//! - Loss functions (MSE, Cross-Entropy)
//! - Trainer configuration
//! - Metrics (history, running averages, top-k accuracy)

mod batch;
mod config;
mod loss;
mod metrics;
mod trainer;

#[cfg(test)]
mod tests;

pub use batch::Batch;
pub use config::DlrtConfig;
pub use loss::{CrossEntropyLoss, LossFn, MSELoss};
pub use metrics::{accuracy, AverageMeter, MetricsTracker};
pub use trainer::{DlrtTrainer, StepOutput};
