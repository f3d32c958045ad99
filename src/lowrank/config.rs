//! Low-rank layer configuration

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Layer kinds eligible for low-rank replacement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerKind {
    Linear,
    Conv2d,
}

impl LayerKind {
    pub const ALL: [LayerKind; 2] = [LayerKind::Linear, LayerKind::Conv2d];

    /// Key used for this kind in epsilon mappings
    pub fn key(&self) -> &'static str {
        match self {
            LayerKind::Linear => "linear",
            LayerKind::Conv2d => "conv2d",
        }
    }
}

/// Rank-truncation thresholds per layer kind
///
/// `ε` is the fraction of singular-value energy allowed to be discarded
/// when the rank is adapted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpsilonConfig {
    pub linear: f32,
    pub conv2d: f32,
}

impl EpsilonConfig {
    /// Same threshold for every layer kind
    pub fn uniform(epsilon: f32) -> Self {
        Self {
            linear: epsilon,
            conv2d: epsilon,
        }
    }

    /// Threshold for one layer kind
    pub fn for_kind(&self, kind: LayerKind) -> f32 {
        match kind {
            LayerKind::Linear => self.linear,
            LayerKind::Conv2d => self.conv2d,
        }
    }

    fn for_kind_mut(&mut self, kind: LayerKind) -> &mut f32 {
        match kind {
            LayerKind::Linear => &mut self.linear,
            LayerKind::Conv2d => &mut self.conv2d,
        }
    }

    /// Parse a user-supplied `{layer kind: float}` mapping
    ///
    /// Kinds missing from the mapping keep the default of 0.1. Anything that
    /// is not a mapping, an unknown key, or a negative or non-finite value is
    /// rejected.
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        let map = value.as_object().ok_or_else(|| {
            Error::InvalidEpsilon(format!(
                "expected a mapping of layer kind to float, got {value}"
            ))
        })?;

        let mut eps = Self::default();
        for (key, raw) in map {
            let v = raw
                .as_f64()
                .ok_or_else(|| Error::InvalidEpsilon(format!("'{key}' must be a number, got {raw}")))?
                as f32;
            let kind = LayerKind::ALL
                .into_iter()
                .find(|kind| kind.key() == key.as_str())
                .ok_or_else(|| {
                    Error::InvalidEpsilon(format!(
                        "unknown layer kind '{key}' (expected 'linear' or 'conv2d')"
                    ))
                })?;
            *eps.for_kind_mut(kind) = v;
        }
        eps.validate()?;
        Ok(eps)
    }

    /// Parse from a string-keyed map, as found in YAML configs
    pub fn from_map(map: &BTreeMap<String, f32>) -> Result<Self> {
        let value = serde_json::to_value(map).map_err(|e| Error::Serialization(e.to_string()))?;
        Self::from_value(&value)
    }

    pub fn validate(&self) -> Result<()> {
        for kind in LayerKind::ALL {
            let v = self.for_kind(kind);
            if !v.is_finite() || v < 0.0 {
                return Err(Error::InvalidEpsilon(format!(
                    "'{}' must be a finite non-negative number, got {v}",
                    kind.key()
                )));
            }
        }
        Ok(())
    }
}

impl Default for EpsilonConfig {
    fn default() -> Self {
        Self::uniform(0.1)
    }
}

/// How the factors of a new low-rank layer are initialized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitMethod {
    /// Fresh uniform weight, truncated SVD
    #[default]
    Random,
    /// Truncated SVD of the replaced dense weight
    Svd,
}

/// Settings shared by every low-rank layer of a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LowRankConfig {
    /// Truncation threshold per layer kind
    pub epsilon: EpsilonConfig,
    /// Cap on the rank as a fraction of `min(n_in, n_out)`
    pub rank_percent: Option<f32>,
    /// Adapt ranks after every S-step
    pub adaptive: bool,
    /// Factor initialization
    pub init_method: InitMethod,
    /// Starting rank; default is half the maximum rank when adaptive, the
    /// maximum rank otherwise
    pub initial_rank: Option<usize>,
    /// Seed for random initialization
    pub seed: u64,
}

impl LowRankConfig {
    /// Create a config with default settings
    pub fn new() -> Self {
        Self {
            epsilon: EpsilonConfig::default(),
            rank_percent: None,
            adaptive: true,
            init_method: InitMethod::Random,
            initial_rank: None,
            seed: 42,
        }
    }

    pub fn with_epsilon(mut self, epsilon: EpsilonConfig) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn with_rank_percent(mut self, rank_percent: f32) -> Self {
        self.rank_percent = Some(rank_percent);
        self
    }

    pub fn with_adaptive(mut self, adaptive: bool) -> Self {
        self.adaptive = adaptive;
        self
    }

    pub fn with_init_method(mut self, init_method: InitMethod) -> Self {
        self.init_method = init_method;
        self
    }

    pub fn with_initial_rank(mut self, rank: usize) -> Self {
        self.initial_rank = Some(rank);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Check thresholds and the rank cap
    pub fn validate(&self) -> Result<()> {
        self.epsilon.validate()?;
        if let Some(p) = self.rank_percent {
            if !(p > 0.0 && p <= 1.0) {
                return Err(Error::InvalidRankPercent(p));
            }
        }
        Ok(())
    }

    /// Largest rank a `n_in × n_out` layer may reach
    pub fn max_rank(&self, n_in: usize, n_out: usize) -> usize {
        let full = n_in.min(n_out);
        match self.rank_percent {
            Some(p) => ((p * full as f32).floor() as usize).clamp(1, full.max(1)),
            None => full,
        }
    }

    /// Rank a freshly built layer starts with
    ///
    /// A requested `initial_rank` is clamped into `[1, max_rank]`, so one
    /// value can serve layers of different capacities.
    pub fn initial_rank(&self, max_rank: usize) -> usize {
        match self.initial_rank {
            Some(r) => r.clamp(1, max_rank.max(1)),
            None if self.adaptive => (max_rank / 2).max(1),
            None => max_rank,
        }
    }
}

impl Default for LowRankConfig {
    fn default() -> Self {
        Self::new()
    }
}
