//! # Rango: Dynamic Low-Rank Training
//!
//! Rango trains networks whose dense layers are factorized as `W = U S Vᵀ`
//! and whose ranks adapt while training. Every step runs three phases:
//! K (`U S`), L (`V Sᵀ`) and S (the Galerkin core), followed by an
//! SVD-based rank adaption of the core.
//!
//! ## Architecture
//!
//! - **autograd**: Tape-based automatic differentiation
//! - **nn**: Dense layers (linear, conv2d) and the layer enum
//! - **lowrank**: Factorized layers, phase forwards and rank adaption
//! - **model**: Layer graph and the replacement orchestrator
//! - **optim**: Optimizers (SGD, Adam, AdamW) and schedulers
//! - **train**: The K → L → S phase controller, losses and metrics
//! - **distributed**: Gradient averaging across data-parallel workers
//! - **config**: Declarative YAML configuration

pub mod autograd;
pub mod config;
pub mod distributed;
pub mod lowrank;
pub mod model;
pub mod nn;
pub mod optim;
pub mod train;

pub mod error;

// Re-export commonly used types
pub use autograd::{backward, Context, Tensor};
pub use error::{Error, Result};
