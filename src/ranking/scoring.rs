//! Reference scoring.

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::types::{ReferenceCounts, ReferenceIndex};

/// Turns a merged reference aggregate into a ranking score.
///
/// Higher score = ranked earlier.
pub trait ReferenceScorer: Send + Sync {
    /// Score one aggregate.
    fn score(&self, references: &ReferenceIndex) -> f64;
}

/// Per-kind weights applied within each origin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KindWeights {
    /// Weight of a quote.
    pub quote: f64,
    /// Weight of a reply.
    pub reply: f64,
    /// Weight of a repost.
    pub repost: f64,
    /// Weight of a like.
    pub like: f64,
}

impl Default for KindWeights {
    fn default() -> Self {
        Self {
            quote: 1.0,
            reply: 1.0,
            repost: 1.0,
            like: 1.0,
        }
    }
}

impl KindWeights {
    /// Weighted sum of `counts`.
    pub fn apply(&self, counts: &ReferenceCounts) -> f64 {
        self.quote * counts.quote as f64
            + self.reply * counts.reply as f64
            + self.repost * counts.repost as f64
            + self.like * counts.like as f64
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for weight in [self.quote, self.reply, self.repost, self.like] {
            check_weight(weight)?;
        }
        Ok(())
    }
}

fn check_weight(weight: f64) -> Result<(), ConfigError> {
    if weight.is_finite() && weight >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidWeight(weight))
    }
}

/// Weighted sum of member and neighbor counts.
///
/// Formula:
/// ```text
/// score = member_weight * kinds(member) + neighbor_weight * kinds(neighbor)
/// ```
///
/// With non-negative weights the score never decreases when a member count
/// grows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightedScorer {
    member_weight: f64,
    neighbor_weight: f64,
    kinds: KindWeights,
}

impl WeightedScorer {
    /// Create a scorer, rejecting a neighbor weight above the member weight.
    pub fn new(member_weight: f64, neighbor_weight: f64, kinds: KindWeights) -> Result<Self, ConfigError> {
        check_weight(member_weight)?;
        check_weight(neighbor_weight)?;
        kinds.validate()?;
        if neighbor_weight > member_weight {
            return Err(ConfigError::WeightOrder { member: member_weight, neighbor: neighbor_weight });
        }
        Ok(Self { member_weight, neighbor_weight, kinds })
    }
}

impl Default for WeightedScorer {
    fn default() -> Self {
        Self {
            member_weight: 1.0,
            neighbor_weight: 0.5,
            kinds: KindWeights::default(),
        }
    }
}

impl ReferenceScorer for WeightedScorer {
    fn score(&self, references: &ReferenceIndex) -> f64 {
        self.member_weight * self.kinds.apply(&references.member)
            + self.neighbor_weight * self.kinds.apply(&references.neighbor)
    }
}
