//! Error types for rango

use crate::lowrank::Phase;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid epsilon: {0}")]
    InvalidEpsilon(String),

    #[error("Optimizer configuration is missing a learning rate ('lr')")]
    MissingLearningRate,

    #[error("rank_percent must be in (0, 1], got {0}")]
    InvalidRankPercent(f32),

    #[error("Non-finite loss {value} in phase {phase}")]
    NonFiniteLoss { phase: Phase, value: f32 },

    #[error("Workers disagree on layer ranks: {worker_ranks:?}")]
    RankDivergence { worker_ranks: Vec<Vec<usize>> },

    #[error("Collective communication failed: {0}")]
    Collective(String),

    #[error("Linear algebra failure: {0}")]
    Linalg(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, Error>;
