//! Top-level configuration.
//!
//! Each component owns its own config struct with production defaults and a
//! `from_env()` constructor; [`KernelConfig`] groups them for the supervisor.
//!
//! ## Environment Variables
//!
//! All variables are prefixed `NEIGHBORHOOD_`. Unset or unparseable values
//! fall back to the default. See the individual `from_env` docs for names.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::crawl::CrawlConfig;
use crate::index::IndexConfig;
use crate::ranking::RankingConfig;
use crate::store::CacheConfig;

/// Read an environment variable, falling back to `default` when unset or
/// unparseable.
pub(crate) fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

/// Configuration rejected by [`KernelConfig::validate`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// A setting that must be positive was zero.
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    /// The crawl error ratio is outside (0, 1].
    #[error("max_error_ratio must be in (0, 1], got {0}")]
    ErrorRatio(f64),
    /// Neighbor-originated references weigh more than member ones.
    #[error("neighbor weight {neighbor} exceeds member weight {member}")]
    WeightOrder {
        /// Member weight.
        member: f64,
        /// Neighbor weight.
        neighbor: f64,
    },
    /// A weight is negative or not finite.
    #[error("weight {0} must be finite and non-negative")]
    InvalidWeight(f64),
    /// The failure cooldown is longer than the success cooldown.
    #[error("failure cooldown must not exceed success cooldown")]
    CooldownOrder,
}

/// All component configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Crawl worker tunables.
    pub crawl: CrawlConfig,
    /// In-memory cache tier.
    pub cache: CacheConfig,
    /// Buffered index flushing and retention.
    pub index: IndexConfig,
    /// Ranking window and weights.
    pub ranking: RankingConfig,
}

impl KernelConfig {
    /// Load every section from the environment.
    pub fn from_env() -> Self {
        Self {
            crawl: CrawlConfig::from_env(),
            cache: CacheConfig::from_env(),
            index: IndexConfig::from_env(),
            ranking: RankingConfig::from_env(),
        }
    }

    /// Reject nonsensical settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.crawl.validate()?;
        if self.cache.enabled && self.cache.max_entries == 0 {
            return Err(ConfigError::Zero("cache.max_entries"));
        }
        if self.cache.read_timeout_ms == 0 {
            return Err(ConfigError::Zero("cache.read_timeout_ms"));
        }
        self.index.validate()?;
        self.ranking.validate()?;
        Ok(())
    }
}
