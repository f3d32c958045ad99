//! Training phase of the K/L/S integrator

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which factor a training sub-step updates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Basis `K = U·S`
    K,
    /// Co-basis `L = V·Sᵀ`
    L,
    /// Coefficient core `S` (and bias)
    S,
}

impl Phase {
    /// All phases in step order
    pub const ALL: [Phase; 3] = [Phase::K, Phase::L, Phase::S];

    pub fn name(&self) -> &'static str {
        match self {
            Phase::K => "k",
            Phase::L => "l",
            Phase::S => "s",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
