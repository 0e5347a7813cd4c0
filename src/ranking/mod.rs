//! Ranking of posts referenced in a group's recent timeline.
//!
//! ## Lookback window
//!
//! ```text
//! local hour >= cutoff:  [H, H-1]
//! local hour <  cutoff:  [H, H-1, H-48]
//! ```
//!
//! Buckets are merged per post, scored, and the top `top_k` are hydrated
//! through the post-content store.

pub mod engine;
pub mod scoring;

use serde::{Deserialize, Serialize};

use crate::clients::ClientError;
use crate::config::{env_or, ConfigError};
use crate::store::StoreError;

pub use engine::{lookback_buckets, merge_buckets, select_top, RankingEngine};
pub use scoring::{KindWeights, ReferenceScorer, WeightedScorer};

/// Error type for ranking.
#[derive(Debug, thiserror::Error)]
pub enum RankingError {
    /// A bucket could not be loaded.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    /// The post-content store failed.
    #[error("Post lookup failed: {0}")]
    PostLookup(#[from] ClientError),
}

/// Ranking configuration.
///
/// ## Environment Variables
///
/// - `NEIGHBORHOOD_RANKING_TOP_K`
/// - `NEIGHBORHOOD_RANKING_MEMBER_WEIGHT`, `NEIGHBORHOOD_RANKING_NEIGHBOR_WEIGHT`
/// - `NEIGHBORHOOD_RANKING_UTC_OFFSET_MINUTES`
/// - `NEIGHBORHOOD_RANKING_EARLY_MORNING_CUTOFF_HOUR`
/// - `NEIGHBORHOOD_RANKING_EARLY_MORNING_LOOKBACK_HOURS`
/// - `NEIGHBORHOOD_RANKING_READ_TIMEOUT_MS`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingConfig {
    /// Posts returned per ranking.
    pub top_k: usize,
    /// Multiplier for member-originated references.
    pub member_weight: f64,
    /// Multiplier for neighbor-originated references.
    pub neighbor_weight: f64,
    /// Per-kind weights.
    pub kind_weights: KindWeights,
    /// Offset of the group's local time from UTC.
    pub utc_offset_minutes: i32,
    /// Before this local hour the window reaches back further.
    pub early_morning_cutoff_hour: u32,
    /// How far back the extra early-morning bucket lies.
    pub early_morning_lookback_hours: i64,
    /// Timeout for one post-content lookup, in milliseconds.
    pub read_timeout_ms: u64,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            top_k: 20,
            member_weight: 1.0,
            neighbor_weight: 0.5,
            kind_weights: KindWeights::default(),
            utc_offset_minutes: 0,
            early_morning_cutoff_hour: 6,
            early_morning_lookback_hours: 48,
            read_timeout_ms: 10_000,
        }
    }
}

impl RankingConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// Kind weights are not read from the environment.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            top_k: env_or("NEIGHBORHOOD_RANKING_TOP_K", d.top_k),
            member_weight: env_or("NEIGHBORHOOD_RANKING_MEMBER_WEIGHT", d.member_weight),
            neighbor_weight: env_or("NEIGHBORHOOD_RANKING_NEIGHBOR_WEIGHT", d.neighbor_weight),
            kind_weights: d.kind_weights,
            utc_offset_minutes: env_or("NEIGHBORHOOD_RANKING_UTC_OFFSET_MINUTES", d.utc_offset_minutes),
            early_morning_cutoff_hour: env_or(
                "NEIGHBORHOOD_RANKING_EARLY_MORNING_CUTOFF_HOUR",
                d.early_morning_cutoff_hour,
            ),
            early_morning_lookback_hours: env_or(
                "NEIGHBORHOOD_RANKING_EARLY_MORNING_LOOKBACK_HOURS",
                d.early_morning_lookback_hours,
            ),
            read_timeout_ms: env_or("NEIGHBORHOOD_RANKING_READ_TIMEOUT_MS", d.read_timeout_ms),
        }
    }

    /// Reject nonsensical settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.top_k == 0 {
            return Err(ConfigError::Zero("ranking.top_k"));
        }
        if self.read_timeout_ms == 0 {
            return Err(ConfigError::Zero("ranking.read_timeout_ms"));
        }
        if self.early_morning_lookback_hours <= 0 {
            return Err(ConfigError::Zero("ranking.early_morning_lookback_hours"));
        }
        self.scorer().map(|_| ())
    }

    /// Default scorer built from the configured weights.
    pub fn scorer(&self) -> Result<WeightedScorer, ConfigError> {
        WeightedScorer::new(self.member_weight, self.neighbor_weight, self.kind_weights)
    }

    /// Post lookup timeout.
    pub fn read_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.read_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(RankingConfig::default().validate().is_ok());
    }

    #[test]
    fn test_neighbor_above_member_rejected() {
        let config = RankingConfig { member_weight: 0.2, neighbor_weight: 0.3, ..RankingConfig::default() };
        assert_eq!(config.validate(), Err(ConfigError::WeightOrder { member: 0.2, neighbor: 0.3 }));
    }

    #[test]
    fn test_zero_top_k_rejected() {
        let config = RankingConfig { top_k: 0, ..RankingConfig::default() };
        assert_eq!(config.validate(), Err(ConfigError::Zero("ranking.top_k")));
    }
}
