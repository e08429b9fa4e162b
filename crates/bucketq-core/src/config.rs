//! Constructor-time configuration for the priority calculation.

use serde::{Deserialize, Serialize};

/// Number of fraction tiers a single key dimension can cross.
pub const MAX_TIERS: usize = 2;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("tier fractions must lie in [0, 1], got tier1={tier1} tier2={tier2}")]
    FractionOutOfRange { tier1: f64, tier2: f64 },

    #[error("tier1 fraction ({tier1}) must not exceed tier2 fraction ({tier2})")]
    TiersOutOfOrder { tier1: f64, tier2: f64 },

    #[error("identity_tiers must be at most 2, got {0}")]
    TooManyIdentityTiers(usize),

    #[error("invalid value {value:?} for {var}")]
    InvalidEnv { var: &'static str, value: String },
}

/// Thresholds used to turn crowding into priority penalties.
///
/// Below `size_threshold` queued requests every entry has priority 1 and the
/// queue is plain FIFO. At or above it, a key whose share of the queue is
/// strictly greater than `tier1_fraction` adds 1, and strictly greater than
/// `tier2_fraction` adds 1 more.
///
/// The IP dimension always uses both tiers. `identity_tiers` selects how many
/// of them apply to the user-agent dimension of anonymous requests: `1`
/// (the default) caps that penalty at +1, `2` makes both dimensions
/// symmetric.
///
/// The default deliberately departs from a symmetric "+2 per dimension"
/// rule: a crowded user agent adds at most +1 unless
/// [`PriorityConfig::symmetric`] is used. Serving order is the same for
/// ordinary traffic mixes; only the reported priority values differ.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityConfig {
    pub size_threshold: usize,
    pub tier1_fraction: f64,
    pub tier2_fraction: f64,
    pub identity_tiers: usize,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            size_threshold: 4,
            tier1_fraction: 0.6,
            tier2_fraction: 0.9,
            identity_tiers: 1,
        }
    }
}

impl PriorityConfig {
    /// Both dimensions can contribute up to +2.
    pub fn symmetric() -> Self {
        Self {
            identity_tiers: MAX_TIERS,
            ..Self::default()
        }
    }

    pub fn tiers(&self) -> [f64; MAX_TIERS] {
        [self.tier1_fraction, self.tier2_fraction]
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let in_range = |f: f64| (0.0..=1.0).contains(&f);
        if !in_range(self.tier1_fraction) || !in_range(self.tier2_fraction) {
            return Err(ConfigError::FractionOutOfRange {
                tier1: self.tier1_fraction,
                tier2: self.tier2_fraction,
            });
        }
        if self.tier1_fraction > self.tier2_fraction {
            return Err(ConfigError::TiersOutOfOrder {
                tier1: self.tier1_fraction,
                tier2: self.tier2_fraction,
            });
        }
        if self.identity_tiers > MAX_TIERS {
            return Err(ConfigError::TooManyIdentityTiers(self.identity_tiers));
        }
        Ok(())
    }

    /// Defaults overridden by `BUCKETQ_SIZE_THRESHOLD`,
    /// `BUCKETQ_TIER1_FRACTION`, `BUCKETQ_TIER2_FRACTION` and
    /// `BUCKETQ_IDENTITY_TIERS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup("BUCKETQ_SIZE_THRESHOLD") {
            config.size_threshold = parse_var("BUCKETQ_SIZE_THRESHOLD", value)?;
        }
        if let Some(value) = lookup("BUCKETQ_TIER1_FRACTION") {
            config.tier1_fraction = parse_var("BUCKETQ_TIER1_FRACTION", value)?;
        }
        if let Some(value) = lookup("BUCKETQ_TIER2_FRACTION") {
            config.tier2_fraction = parse_var("BUCKETQ_TIER2_FRACTION", value)?;
        }
        if let Some(value) = lookup("BUCKETQ_IDENTITY_TIERS") {
            config.identity_tiers = parse_var("BUCKETQ_IDENTITY_TIERS", value)?;
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_var<V: std::str::FromStr>(var: &'static str, value: String) -> Result<V, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { var, value })
}
