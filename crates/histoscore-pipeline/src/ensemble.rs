//! Two-tier ensemble: category scores are combined within each tier,
//! then the tiers are combined with fixed weights.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::aggregate::{CategoryBreakdown, Tier, WEIGHT_TOLERANCE, WeightedAggregator};
use crate::types::PipelineError;

/// Tier weights and the final confidence cap.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    /// Weight of the morphometric tier.
    pub morphometric_weight: f64,
    /// Weight of the pattern tier.
    pub pattern_weight: f64,
    /// Upper bound on the final confidence.
    pub confidence_cap: f64,
}

impl EnsembleConfig {
    /// Default morphometric tier weight.
    pub const DEFAULT_MORPHOMETRIC_WEIGHT: f64 = 0.7;
    /// Default pattern tier weight.
    pub const DEFAULT_PATTERN_WEIGHT: f64 = 0.3;
    /// Default final confidence cap.
    pub const DEFAULT_CONFIDENCE_CAP: f64 = 0.95;

    /// Weight of `tier`.
    #[must_use]
    pub const fn weight(&self, tier: Tier) -> f64 {
        match tier {
            Tier::Morphometric => self.morphometric_weight,
            Tier::Pattern => self.pattern_weight,
        }
    }
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            morphometric_weight: Self::DEFAULT_MORPHOMETRIC_WEIGHT,
            pattern_weight: Self::DEFAULT_PATTERN_WEIGHT,
            confidence_cap: Self::DEFAULT_CONFIDENCE_CAP,
        }
    }
}

/// Score and confidence of one tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierScore {
    /// Tier weight in the final score.
    pub weight: f64,
    /// Weighted category score in `[0, 1]`.
    pub score: f64,
    /// Weighted category confidence in `[0, 1]`.
    pub confidence: f64,
}

/// The integrated result before classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleScore {
    /// Final score in `[0, 1]`.
    pub final_score: f64,
    /// Final confidence in `[0, confidence_cap]`.
    pub confidence: f64,
    /// Per-tier scores.
    pub tiers: BTreeMap<Tier, TierScore>,
}

/// Combines category results into a final score.
#[derive(Debug, Clone)]
pub struct EnsembleIntegrator {
    config: EnsembleConfig,
}

impl EnsembleIntegrator {
    /// Validate the tier weights against the categories `aggregator` holds.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Configuration`] if a tier weight is
    /// negative, the tier weights do not sum to 1, a tier has no
    /// categories, the category weights inside a tier do not sum to 1,
    /// or the confidence cap is outside `[0, 1]`.
    pub fn new(
        config: &EnsembleConfig,
        aggregator: &WeightedAggregator,
    ) -> Result<Self, PipelineError> {
        let weights = Tier::ALL.map(|t| config.weight(t));
        if weights.iter().any(|w| !(w.is_finite() && *w >= 0.0)) {
            return Err(PipelineError::Configuration(format!(
                "tier weights must be non-negative, got {weights:?}"
            )));
        }
        let sum: f64 = weights.iter().sum();
        if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(PipelineError::Configuration(format!(
                "tier weights sum to {sum}, expected 1"
            )));
        }
        if !(0.0..=1.0).contains(&config.confidence_cap) {
            return Err(PipelineError::Configuration(format!(
                "confidence_cap must be in [0, 1], got {}",
                config.confidence_cap
            )));
        }
        for tier in Tier::ALL {
            let members: Vec<f64> = aggregator
                .categories()
                .iter()
                .filter(|c| c.tier() == tier)
                .map(crate::aggregate::Category::weight)
                .collect();
            if members.is_empty() {
                return Err(PipelineError::Configuration(format!(
                    "tier `{tier}` has no categories"
                )));
            }
            let tier_sum: f64 = members.iter().sum();
            if (tier_sum - 1.0).abs() > WEIGHT_TOLERANCE {
                return Err(PipelineError::Configuration(format!(
                    "category weights in tier `{tier}` sum to {tier_sum}, expected 1"
                )));
            }
        }
        Ok(Self { config: *config })
    }

    /// The validated configuration.
    #[must_use]
    pub const fn config(&self) -> &EnsembleConfig {
        &self.config
    }

    /// Combine category breakdowns into the final score and confidence.
    #[must_use]
    pub fn integrate(&self, categories: &BTreeMap<String, CategoryBreakdown>) -> EnsembleScore {
        let tiers: BTreeMap<Tier, TierScore> = Tier::ALL
            .into_iter()
            .map(|tier| {
                let (score, confidence) = categories
                    .values()
                    .filter(|c| c.tier == tier)
                    .fold((0.0, 0.0), |(s, c), cat| {
                        (
                            cat.weight.mul_add(cat.score, s),
                            cat.weight.mul_add(cat.confidence, c),
                        )
                    });
                let tier_score = TierScore {
                    weight: self.config.weight(tier),
                    score: score.clamp(0.0, 1.0),
                    confidence: confidence.clamp(0.0, 1.0),
                };
                (tier, tier_score)
            })
            .collect();

        let (final_score, confidence) = tiers.values().fold((0.0, 0.0), |(s, c), t| {
            (t.weight.mul_add(t.score, s), t.weight.mul_add(t.confidence, c))
        });

        EnsembleScore {
            final_score: final_score.clamp(0.0, 1.0),
            confidence: confidence.clamp(0.0, self.config.confidence_cap),
            tiers,
        }
    }
}
