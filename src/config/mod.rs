//! Declarative YAML configuration
//!
//! A DLRT run is described by an optimizer, the low-rank settings and the
//! training hyperparameters.
//!
//! # Example
//!
//! ```yaml
//! optimizer:
//!   name: sgd
//!   lr: 0.05
//!   momentum: 0.9
//!
//! dlrt:
//!   epsilon: {linear: 0.1, conv2d: 0.05}
//!   rank_percent: 0.5
//!   adaptive: true
//!
//! training:
//!   epochs: 20
//!   lr_scheduler:
//!     name: cosine
//!     lr_min: 0.001
//! ```

mod builder;
mod schema;
mod train;
mod validate;



pub use builder::{build_low_rank_config, build_optimizer, build_scheduler};
pub use schema::{DlrtParams, DlrtSpec, OptimSpec, SchedulerSpec, TrainingParams};
pub use train::{build_trainer, load_config, parse_config};
pub use validate::{validate_config, ValidationError};
