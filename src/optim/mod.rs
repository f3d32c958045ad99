//! Optimizers for training neural networks

mod adam;
mod adamw;
mod clip;
mod optimizer;
mod scheduler;
mod sgd;

pub use adam::Adam;
pub use adamw::AdamW;
pub use clip::{clip_grad_norm, clip_grad_norm_refs, global_grad_norm};
pub use optimizer::Optimizer;
pub use scheduler::{CosineAnnealingLR, LRScheduler, StepLR};
pub use sgd::SGD;
