//! Per-category weighted aggregation of criterion scores.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::criteria::{Criterion, CriterionScore, CriterionScorer};
use crate::features::FeatureSet;
use crate::types::{InsufficientData, PipelineError};

/// Allowed deviation of a weight sum from 1.
pub const WEIGHT_TOLERANCE: f64 = 1e-6;

/// Which ensemble tier a category belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Size, shape and density measurements.
    Morphometric,
    /// Texture and spatial-arrangement measurements.
    Pattern,
}

impl Tier {
    /// All tiers, in reporting order.
    pub const ALL: [Self; 2] = [Self::Morphometric, Self::Pattern];
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Morphometric => "morphometric",
            Self::Pattern => "pattern",
        })
    }
}

/// Configuration for one category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryConfig {
    /// Unique category name.
    pub name: String,
    /// Ensemble tier.
    pub tier: Tier,
    /// Weight within the tier.
    pub weight: f64,
    /// Criteria; their weights must sum to 1.
    pub criteria: Vec<Criterion>,
}

/// Category-level confidence shaping.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceShaping {
    /// Added to the mean criterion confidence.
    pub boost: f64,
    /// Upper bound on the boosted confidence.
    pub cap: f64,
}

impl Default for ConfidenceShaping {
    fn default() -> Self {
        Self {
            boost: 0.05,
            cap: 0.95,
        }
    }
}

/// A validated category.
#[derive(Debug, Clone)]
pub struct Category {
    name: String,
    tier: Tier,
    weight: f64,
    scorer: CriterionScorer,
}

impl Category {
    /// Validate one category.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Configuration`] if the name is empty,
    /// the weight is negative or non-finite, a criterion is invalid, or
    /// the criterion weights do not sum to 1.
    pub fn new(
        config: &CategoryConfig,
        feature_names: &[String],
        degraded_confidence_factor: f64,
    ) -> Result<Self, PipelineError> {
        if config.name.is_empty() {
            return Err(PipelineError::Configuration(
                "category names must not be empty".to_string(),
            ));
        }
        if !(config.weight.is_finite() && config.weight >= 0.0) {
            return Err(PipelineError::Configuration(format!(
                "category `{}` has invalid weight {}",
                config.name, config.weight
            )));
        }
        let scorer = CriterionScorer::new(&config.criteria, feature_names, degraded_confidence_factor)
            .map_err(|e| match e {
                PipelineError::Configuration(msg) => {
                    PipelineError::Configuration(format!("category `{}`: {msg}", config.name))
                }
                other @ PipelineError::InputValidation(_) => other,
            })?;
        let sum = scorer.weight_sum();
        if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(PipelineError::Configuration(format!(
                "criterion weights of category `{}` sum to {sum}, expected 1",
                config.name
            )));
        }
        Ok(Self {
            name: config.name.clone(),
            tier: config.tier,
            weight: config.weight,
            scorer,
        })
    }

    /// Category name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ensemble tier.
    #[must_use]
    pub const fn tier(&self) -> Tier {
        self.tier
    }

    /// Weight within the tier.
    #[must_use]
    pub const fn weight(&self) -> f64 {
        self.weight
    }

    /// Criterion registry.
    #[must_use]
    pub const fn scorer(&self) -> &CriterionScorer {
        &self.scorer
    }
}

/// The scored outcome of one category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryBreakdown {
    /// Ensemble tier.
    pub tier: Tier,
    /// Weight within the tier.
    pub weight: f64,
    /// Weighted criterion score in `[0, 1]`.
    pub score: f64,
    /// Boosted, capped mean criterion confidence.
    pub confidence: f64,
    /// Values of the features this category read.
    pub features: BTreeMap<String, f64>,
    /// Per-criterion scores, in configuration order.
    pub criteria: Vec<CriterionScore>,
    /// Insufficient-data records from every criterion.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub insufficient: Vec<InsufficientData>,
}

/// Scores every category from one feature set.
#[derive(Debug, Clone)]
pub struct WeightedAggregator {
    categories: Vec<Category>,
    shaping: ConfidenceShaping,
}

impl WeightedAggregator {
    /// Validate `categories` against the declared `feature_names`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Configuration`] if there are no
    /// categories, two share a name, any category is invalid, or the
    /// confidence shaping is outside `[0, 1]`.
    pub fn new(
        categories: &[CategoryConfig],
        feature_names: &[String],
        shaping: ConfidenceShaping,
        degraded_confidence_factor: f64,
    ) -> Result<Self, PipelineError> {
        if categories.is_empty() {
            return Err(PipelineError::Configuration(
                "at least one category is required".to_string(),
            ));
        }
        let unit = |v: f64| (0.0..=1.0).contains(&v);
        if !(unit(shaping.boost) && unit(shaping.cap)) {
            return Err(PipelineError::Configuration(format!(
                "category confidence boost and cap must be in [0, 1], got {} and {}",
                shaping.boost, shaping.cap
            )));
        }
        if !(0.0..1.0).contains(&degraded_confidence_factor) {
            return Err(PipelineError::Configuration(format!(
                "degraded_confidence_factor must be in [0, 1), got {degraded_confidence_factor}"
            )));
        }
        let mut built: Vec<Category> = Vec::with_capacity(categories.len());
        for config in categories {
            if built.iter().any(|c| c.name == config.name) {
                return Err(PipelineError::Configuration(format!(
                    "duplicate category `{}`",
                    config.name
                )));
            }
            built.push(Category::new(
                config,
                feature_names,
                degraded_confidence_factor,
            )?);
        }
        Ok(Self {
            categories: built,
            shaping,
        })
    }

    /// The validated categories, in configuration order.
    #[must_use]
    pub fn categories(&self) -> &[Category] {
        &self.categories
    }

    /// Score every category. Keys are category names.
    #[must_use]
    pub fn aggregate(&self, features: &FeatureSet) -> BTreeMap<String, CategoryBreakdown> {
        self.categories
            .iter()
            .map(|category| (category.name.clone(), self.score_category(category, features)))
            .collect()
    }

    #[allow(clippy::cast_precision_loss)]
    fn score_category(&self, category: &Category, features: &FeatureSet) -> CategoryBreakdown {
        let criteria = category.scorer.score(features);
        let score = criteria
            .iter()
            .map(|c| c.weight * c.score)
            .sum::<f64>()
            .clamp(0.0, 1.0);
        let mean_confidence =
            criteria.iter().map(|c| c.confidence).sum::<f64>() / criteria.len() as f64;
        let confidence = (mean_confidence + self.shaping.boost).min(self.shaping.cap);

        let read = category.scorer.criteria().iter().flat_map(|c| &c.inputs);
        let features_read = read
            .filter_map(|term| {
                features
                    .value(&term.feature)
                    .map(|v| (term.feature.clone(), v))
            })
            .collect();

        let mut insufficient: Vec<InsufficientData> = Vec::new();
        for record in criteria.iter().flat_map(|c| &c.insufficient) {
            if !insufficient.contains(record) {
                insufficient.push(record.clone());
            }
        }

        CategoryBreakdown {
            tier: category.tier,
            weight: category.weight,
            score,
            confidence,
            features: features_read,
            criteria,
            insufficient,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::criteria::{ConfidenceModel, FeatureTerm, ScoringFunction};
    use crate::features::Feature;

    fn criterion(name: &str, feature: &str, weight: f64, confidence: f64) -> Criterion {
        Criterion {
            name: name.to_string(),
            inputs: vec![FeatureTerm::of(feature)],
            scoring: ScoringFunction::Linear {
                low: 0.0,
                high: 1.0,
            },
            weight,
            confidence: ConfidenceModel::Fixed { value: confidence },
        }
    }

    fn category(name: &str, tier: Tier, criteria: Vec<Criterion>) -> CategoryConfig {
        CategoryConfig {
            name: name.to_string(),
            tier,
            weight: 1.0,
            criteria,
        }
    }

    fn feature_names() -> Vec<String> {
        vec!["a".to_string(), "b".to_string()]
    }

    fn features(a: f64, b: Option<f64>) -> FeatureSet {
        let b = b.map_or_else(
            || Feature {
                value: 0.0,
                insufficient: Some(InsufficientData {
                    feature: "b".to_string(),
                    population: 1,
                    required: 3,
                }),
            },
            |value| Feature {
                value,
                insufficient: None,
            },
        );
        [
            (
                "a".to_string(),
                Feature {
                    value: a,
                    insufficient: None,
                },
            ),
            ("b".to_string(), b),
        ]
        .into_iter()
        .collect()
    }

    fn aggregator(categories: &[CategoryConfig]) -> WeightedAggregator {
        WeightedAggregator::new(
            categories,
            &feature_names(),
            ConfidenceShaping::default(),
            0.5,
        )
        .unwrap()
    }

    #[test]
    fn weighted_score_and_boosted_confidence() {
        let agg = aggregator(&[category(
            "shape",
            Tier::Morphometric,
            vec![criterion("x", "a", 0.25, 0.6), criterion("y", "b", 0.75, 0.8)],
        )]);
        let out = agg.aggregate(&features(0.4, Some(0.8)));
        let shape = &out["shape"];
        assert!((shape.score - (0.25 * 0.4 + 0.75 * 0.8)).abs() < 1e-12);
        assert!((shape.confidence - 0.75).abs() < 1e-12);
        assert_eq!(shape.features.len(), 2);
        assert!(shape.insufficient.is_empty());
    }

    #[test]
    fn confidence_is_capped() {
        let agg = aggregator(&[category(
            "shape",
            Tier::Morphometric,
            vec![criterion("x", "a", 1.0, 1.0)],
        )]);
        let out = agg.aggregate(&features(0.5, Some(0.5)));
        assert!((out["shape"].confidence - 0.95).abs() < 1e-12);
    }

    #[test]
    fn insufficient_feature_is_recorded_once() {
        let agg = aggregator(&[category(
            "shape",
            Tier::Pattern,
            vec![
                criterion("x", "b", 0.5, 0.8),
                Criterion {
                    inputs: vec![FeatureTerm::of("a"), FeatureTerm::of("b")],
                    ..criterion("y", "a", 0.5, 0.8)
                },
            ],
        )]);
        let out = agg.aggregate(&features(0.9, None));
        let shape = &out["shape"];
        assert_eq!(shape.insufficient.len(), 1);
        assert!((shape.score).abs() < f64::EPSILON);
        // Both criteria degraded: mean 0.4, plus boost.
        assert!((shape.confidence - 0.45).abs() < 1e-12);
    }

    #[test]
    fn rejects_weights_not_summing_to_one() {
        let result = WeightedAggregator::new(
            &[category(
                "shape",
                Tier::Morphometric,
                vec![criterion("x", "a", 0.5, 0.8), criterion("y", "b", 0.4, 0.8)],
            )],
            &feature_names(),
            ConfidenceShaping::default(),
            0.5,
        );
        let err = result.unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
        assert!(err.to_string().contains("sum to"), "{err}");
    }

    #[test]
    fn accepts_weights_within_tolerance() {
        let result = WeightedAggregator::new(
            &[category(
                "shape",
                Tier::Morphometric,
                vec![
                    criterion("x", "a", 0.5, 0.8),
                    criterion("y", "b", 0.500_000_5, 0.8),
                ],
            )],
            &feature_names(),
            ConfidenceShaping::default(),
            0.5,
        );
        assert!(result.is_ok());
    }

    #[test]
    fn rejects_duplicate_categories() {
        let c = category("shape", Tier::Morphometric, vec![criterion("x", "a", 1.0, 0.8)]);
        let result = WeightedAggregator::new(
            &[c.clone(), c],
            &feature_names(),
            ConfidenceShaping::default(),
            0.5,
        );
        assert!(matches!(result, Err(PipelineError::Configuration(_))));
    }

    #[test]
    fn rejects_empty_category_list() {
        let result =
            WeightedAggregator::new(&[], &feature_names(), ConfidenceShaping::default(), 0.5);
        assert!(result.is_err());
    }

    #[test]
    fn tier_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&Tier::Morphometric).unwrap(),
            "\"morphometric\""
        );
        assert_eq!(Tier::Pattern.to_string(), "pattern");
    }
}
