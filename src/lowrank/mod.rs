//! Dynamic low-rank layers
//!
//! Dense weights are replaced by `U · S · Vᵀ` factors trained in three
//! phases (K, L, S) with the rank re-selected from the singular values of
//! `S` after every step.

mod config;
mod conv;
mod factors;
pub mod linalg;
mod linear;
mod phase;
mod rank;
mod unit;


pub use config::{EpsilonConfig, InitMethod, LayerKind, LowRankConfig};
pub use conv::LowRankConv2d;
pub use factors::LowRankCore;
pub use linear::LowRankLinear;
pub use phase::Phase;
pub use rank::select_rank;
pub use unit::{LayerCommand, LowRankUnit};
