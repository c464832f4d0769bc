//! Criteria: named, weighted scoring rules over a [`FeatureSet`].
//!
//! A criterion combines one or more features linearly, maps the result
//! through a [`ScoringFunction`] onto `[0, 1]`, and attaches a
//! confidence from its [`ConfidenceModel`]. Criteria are configuration:
//! they are validated once by [`CriterionScorer::new`] and never change.
//!
//! When an input feature is insufficient the criterion does not score
//! the sentinel. It contributes `0.0` (no evidence), records the
//! shortfall, and its confidence is scaled by the degradation factor.

use serde::{Deserialize, Serialize};

use crate::features::FeatureSet;
use crate::types::{InsufficientData, PipelineError};

const fn one() -> f64 {
    1.0
}

/// One term of a criterion's input: `coefficient * feature`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureTerm {
    /// Feature name.
    pub feature: String,
    /// Multiplier applied to the feature value.
    #[serde(default = "one")]
    pub coefficient: f64,
}

impl FeatureTerm {
    /// A term with coefficient 1.
    #[must_use]
    pub fn of(feature: impl Into<String>) -> Self {
        Self {
            feature: feature.into(),
            coefficient: 1.0,
        }
    }

    /// A term with an explicit coefficient.
    #[must_use]
    pub fn scaled(feature: impl Into<String>, coefficient: f64) -> Self {
        Self {
            feature: feature.into(),
            coefficient,
        }
    }
}

/// One step of a [`ScoringFunction::Bands`] table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// The step applies when the input is strictly greater than this.
    pub above: f64,
    /// Score for inputs in this step.
    pub score: f64,
}

/// Maps a criterion input onto `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScoringFunction {
    /// Linear ramp from 0 at `low` to 1 at `high`, clamped outside.
    /// Reversed when `low > high`.
    Linear {
        /// Input scoring 0.
        low: f64,
        /// Input scoring 1.
        high: f64,
    },
    /// Step table with ascending cutoffs; the last step whose cutoff
    /// the input strictly exceeds wins.
    Bands {
        /// Steps in ascending `above` order.
        steps: Vec<Step>,
        /// Score when no cutoff is exceeded.
        #[serde(default)]
        below: f64,
    },
    /// Triangular peak: 1 at `center`, falling to 0 at `center ± tolerance`.
    Target {
        /// Ideal input.
        center: f64,
        /// Half-width of the peak.
        tolerance: f64,
    },
    /// `1 / (1 + exp(-steepness * (x - midpoint)))`.
    Logistic {
        /// Input scoring 0.5.
        midpoint: f64,
        /// Slope; negative values reverse the curve.
        steepness: f64,
    },
}

impl ScoringFunction {
    /// Score `x`. Always inside `[0, 1]`; a non-finite input scores 0.
    #[must_use]
    pub fn score(&self, x: f64) -> f64 {
        if !x.is_finite() {
            return 0.0;
        }
        let raw = match self {
            Self::Linear { low, high } => (x - low) / (high - low),
            Self::Bands { steps, below } => steps
                .iter()
                .rev()
                .find(|s| x > s.above)
                .map_or(*below, |s| s.score),
            Self::Target { center, tolerance } => 1.0 - (x - center).abs() / tolerance,
            Self::Logistic {
                midpoint,
                steepness,
            } => 1.0 / (1.0 + (-steepness * (x - midpoint)).exp()),
        };
        raw.clamp(0.0, 1.0)
    }

    fn validate(&self) -> Result<(), String> {
        let finite = |v: f64| v.is_finite();
        let unit = |v: f64| (0.0..=1.0).contains(&v);
        match self {
            Self::Linear { low, high } => {
                if !(finite(*low) && finite(*high)) || (high - low).abs() < f64::EPSILON {
                    return Err(format!("linear needs finite, distinct bounds, got {low}..{high}"));
                }
            }
            Self::Bands { steps, below } => {
                if steps.is_empty() {
                    return Err("bands need at least one step".to_string());
                }
                if !unit(*below) || steps.iter().any(|s| !finite(s.above) || !unit(s.score)) {
                    return Err("band cutoffs must be finite and scores in [0, 1]".to_string());
                }
                if steps.windows(2).any(|w| w[0].above >= w[1].above) {
                    return Err("band cutoffs must be strictly ascending".to_string());
                }
            }
            Self::Target { center, tolerance } => {
                if !finite(*center) || !(finite(*tolerance) && *tolerance > 0.0) {
                    return Err(format!(
                        "target needs a finite center and positive tolerance, got {center} ± {tolerance}"
                    ));
                }
            }
            Self::Logistic {
                midpoint,
                steepness,
            } => {
                if !(finite(*midpoint) && finite(*steepness)) || *steepness == 0.0 {
                    return Err("logistic needs a finite midpoint and non-zero steepness".to_string());
                }
            }
        }
        Ok(())
    }
}

/// How much a criterion's score can be trusted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConfidenceModel {
    /// Constant confidence.
    Fixed {
        /// Confidence in `[0, 1]`.
        value: f64,
    },
    /// Scores near 0 or 1 are trusted more than scores near 0.5:
    /// `floor + (ceiling - floor) * |2s - 1|`.
    Decisiveness {
        /// Confidence at `s = 0.5`.
        floor: f64,
        /// Confidence at `s = 0` or `s = 1`.
        ceiling: f64,
    },
    /// Confidence grows with a population-size feature until
    /// `saturation`.
    Support {
        /// Feature holding the population size (e.g. a peak count).
        feature: String,
        /// Population at which `ceiling` is reached.
        saturation: f64,
        /// Confidence with an empty population.
        floor: f64,
        /// Confidence at or beyond saturation.
        ceiling: f64,
    },
}

impl ConfidenceModel {
    /// Confidence for `score` given the measured `features`.
    #[must_use]
    pub fn confidence(&self, score: f64, features: &FeatureSet) -> f64 {
        let value = match self {
            Self::Fixed { value } => *value,
            Self::Decisiveness { floor, ceiling } => {
                (ceiling - floor).mul_add(2.0f64.mul_add(score, -1.0).abs(), *floor)
            }
            Self::Support {
                feature,
                saturation,
                floor,
                ceiling,
            } => {
                let population = features
                    .get(feature)
                    .filter(|f| !f.is_insufficient())
                    .map_or(0.0, |f| f.value.max(0.0));
                let fill = (population / saturation).min(1.0);
                (ceiling - floor).mul_add(fill, *floor)
            }
        };
        value.clamp(0.0, 1.0)
    }

    /// The lowest confidence this model can report for measured data.
    #[must_use]
    pub fn minimum(&self) -> f64 {
        let value = match self {
            Self::Fixed { value } => *value,
            Self::Decisiveness { floor, ceiling } | Self::Support { floor, ceiling, .. } => {
                floor.min(*ceiling)
            }
        };
        value.clamp(0.0, 1.0)
    }

    fn feature(&self) -> Option<&str> {
        match self {
            Self::Support { feature, .. } => Some(feature.as_str()),
            Self::Fixed { .. } | Self::Decisiveness { .. } => None,
        }
    }

    fn validate(&self) -> Result<(), String> {
        let unit = |v: f64| (0.0..=1.0).contains(&v);
        match self {
            Self::Fixed { value } if !unit(*value) => {
                Err(format!("fixed confidence must be in [0, 1], got {value}"))
            }
            Self::Decisiveness { floor, ceiling } | Self::Support { floor, ceiling, .. }
                if !(unit(*floor) && unit(*ceiling)) =>
            {
                Err(format!(
                    "confidence floor/ceiling must be in [0, 1], got {floor}/{ceiling}"
                ))
            }
            Self::Support { saturation, .. } if !(saturation.is_finite() && *saturation > 0.0) => {
                Err(format!("support saturation must be positive, got {saturation}"))
            }
            _ => Ok(()),
        }
    }
}

/// A named, weighted scoring rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Criterion {
    /// Unique name within its category.
    pub name: String,
    /// Features combined linearly into the scoring input.
    pub inputs: Vec<FeatureTerm>,
    /// Maps the input onto `[0, 1]`.
    pub scoring: ScoringFunction,
    /// Fixed weight within the category.
    pub weight: f64,
    /// Confidence heuristic.
    pub confidence: ConfidenceModel,
}

/// The outcome of evaluating one criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionScore {
    /// Criterion name.
    pub name: String,
    /// Combined input value.
    pub input: f64,
    /// Score in `[0, 1]`; `0.0` when an input was insufficient.
    pub score: f64,
    /// Confidence in `[0, 1]`, degraded when an input was insufficient.
    pub confidence: f64,
    /// Weight within the category.
    pub weight: f64,
    /// Insufficient inputs, if any.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub insufficient: Vec<InsufficientData>,
}

/// The validated criteria of one category.
#[derive(Debug, Clone)]
pub struct CriterionScorer {
    criteria: Vec<Criterion>,
    degraded_confidence_factor: f64,
}

impl CriterionScorer {
    /// Validate `criteria` against the declared `feature_names`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Configuration`] for an empty list, an
    /// empty or duplicate name, a criterion without inputs, a reference
    /// to an undeclared feature, a negative or non-finite weight, an
    /// invalid scoring function or confidence model, or a
    /// `degraded_confidence_factor` outside `[0, 1)`.
    pub fn new(
        criteria: &[Criterion],
        feature_names: &[String],
        degraded_confidence_factor: f64,
    ) -> Result<Self, PipelineError> {
        if criteria.is_empty() {
            return Err(PipelineError::Configuration(
                "a category needs at least one criterion".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&degraded_confidence_factor) {
            return Err(PipelineError::Configuration(format!(
                "degraded_confidence_factor must be in [0, 1), got {degraded_confidence_factor}"
            )));
        }
        let known = |name: &str| feature_names.iter().any(|f| f == name);
        for (i, criterion) in criteria.iter().enumerate() {
            let fail = |msg: String| {
                PipelineError::Configuration(format!("criterion `{}`: {msg}", criterion.name))
            };
            if criterion.name.is_empty() {
                return Err(PipelineError::Configuration(
                    "criterion names must not be empty".to_string(),
                ));
            }
            if criteria[..i].iter().any(|c| c.name == criterion.name) {
                return Err(fail("duplicate name".to_string()));
            }
            if criterion.inputs.is_empty() {
                return Err(fail("needs at least one input".to_string()));
            }
            for term in &criterion.inputs {
                if !known(&term.feature) {
                    return Err(fail(format!("unknown feature `{}`", term.feature)));
                }
                if !term.coefficient.is_finite() {
                    return Err(fail(format!("non-finite coefficient for `{}`", term.feature)));
                }
            }
            if let Some(feature) = criterion.confidence.feature()
                && !known(feature)
            {
                return Err(fail(format!("unknown confidence feature `{feature}`")));
            }
            if !(criterion.weight.is_finite() && criterion.weight >= 0.0) {
                return Err(fail(format!("invalid weight {}", criterion.weight)));
            }
            criterion.scoring.validate().map_err(fail)?;
            criterion.confidence.validate().map_err(fail)?;
        }
        Ok(Self {
            criteria: criteria.to_vec(),
            degraded_confidence_factor,
        })
    }

    /// The validated criteria, in configuration order.
    #[must_use]
    pub fn criteria(&self) -> &[Criterion] {
        &self.criteria
    }

    /// Sum of the criterion weights.
    #[must_use]
    pub fn weight_sum(&self) -> f64 {
        self.criteria.iter().map(|c| c.weight).sum()
    }

    /// Evaluate every criterion.
    #[must_use]
    pub fn score(&self, features: &FeatureSet) -> Vec<CriterionScore> {
        self.criteria
            .iter()
            .map(|criterion| self.evaluate(criterion, features))
            .collect()
    }

    fn evaluate(&self, criterion: &Criterion, features: &FeatureSet) -> CriterionScore {
        let mut input = 0.0;
        let mut insufficient = Vec::new();
        for term in &criterion.inputs {
            match features.get(&term.feature) {
                Some(feature) => {
                    if let Some(record) = &feature.insufficient {
                        insufficient.push(record.clone());
                    }
                    input = term.coefficient.mul_add(feature.value, input);
                }
                None => insufficient.push(InsufficientData {
                    feature: term.feature.clone(),
                    population: 0,
                    required: 1,
                }),
            }
        }
        let (score, confidence) = if insufficient.is_empty() {
            let score = criterion.scoring.score(input);
            (score, criterion.confidence.confidence(score, features))
        } else {
            (
                0.0,
                criterion.confidence.minimum() * self.degraded_confidence_factor,
            )
        };
        CriterionScore {
            name: criterion.name.clone(),
            input,
            score,
            confidence,
            weight: criterion.weight,
            insufficient,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::features::Feature;

    fn features(entries: &[(&str, f64, bool)]) -> FeatureSet {
        entries
            .iter()
            .map(|&(name, value, insufficient)| {
                let feature = Feature {
                    value,
                    insufficient: insufficient.then(|| InsufficientData {
                        feature: name.to_string(),
                        population: 0,
                        required: 3,
                    }),
                };
                (name.to_string(), feature)
            })
            .collect()
    }

    fn criterion(name: &str, feature: &str, weight: f64) -> Criterion {
        Criterion {
            name: name.to_string(),
            inputs: vec![FeatureTerm::of(feature)],
            scoring: ScoringFunction::Linear {
                low: 0.0,
                high: 1.0,
            },
            weight,
            confidence: ConfidenceModel::Fixed { value: 0.8 },
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    // --- scoring functions ---

    #[test]
    fn linear_ramps_and_clamps() {
        let f = ScoringFunction::Linear {
            low: 1.0,
            high: 3.0,
        };
        assert!((f.score(0.0)).abs() < f64::EPSILON);
        assert!((f.score(2.0) - 0.5).abs() < 1e-12);
        assert!((f.score(9.0) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn reversed_linear_decreases() {
        let f = ScoringFunction::Linear {
            low: 1.0,
            high: 0.0,
        };
        assert!((f.score(0.0) - 1.0).abs() < f64::EPSILON);
        assert!((f.score(0.75) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn bands_use_strict_boundaries() {
        let f = ScoringFunction::Bands {
            steps: vec![
                Step {
                    above: 10.0,
                    score: 0.4,
                },
                Step {
                    above: 20.0,
                    score: 0.9,
                },
            ],
            below: 0.1,
        };
        assert!((f.score(10.0) - 0.1).abs() < f64::EPSILON);
        assert!((f.score(10.5) - 0.4).abs() < f64::EPSILON);
        assert!((f.score(20.0) - 0.4).abs() < f64::EPSILON);
        assert!((f.score(25.0) - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn target_peaks_at_center() {
        let f = ScoringFunction::Target {
            center: 5.0,
            tolerance: 2.0,
        };
        assert!((f.score(5.0) - 1.0).abs() < f64::EPSILON);
        assert!((f.score(6.0) - 0.5).abs() < 1e-12);
        assert!((f.score(8.0)).abs() < f64::EPSILON);
    }

    #[test]
    fn logistic_is_half_at_midpoint() {
        let f = ScoringFunction::Logistic {
            midpoint: 0.5,
            steepness: 10.0,
        };
        assert!((f.score(0.5) - 0.5).abs() < 1e-12);
        assert!(f.score(1.0) > 0.99);
    }

    #[test]
    fn non_finite_input_scores_zero() {
        let f = ScoringFunction::Linear {
            low: 0.0,
            high: 1.0,
        };
        assert!((f.score(f64::NAN)).abs() < f64::EPSILON);
    }

    // --- confidence models ---

    #[test]
    fn decisiveness_is_lowest_at_half() {
        let model = ConfidenceModel::Decisiveness {
            floor: 0.4,
            ceiling: 0.9,
        };
        let empty = FeatureSet::default();
        assert!((model.confidence(0.5, &empty) - 0.4).abs() < 1e-12);
        assert!((model.confidence(1.0, &empty) - 0.9).abs() < 1e-12);
        assert!((model.confidence(0.0, &empty) - 0.9).abs() < 1e-12);
    }

    #[test]
    fn support_saturates() {
        let model = ConfidenceModel::Support {
            feature: "count".to_string(),
            saturation: 10.0,
            floor: 0.2,
            ceiling: 0.8,
        };
        let half = features(&[("count", 5.0, false)]);
        let many = features(&[("count", 50.0, false)]);
        let none = features(&[("count", 0.0, true)]);
        assert!((model.confidence(0.3, &half) - 0.5).abs() < 1e-12);
        assert!((model.confidence(0.3, &many) - 0.8).abs() < 1e-12);
        assert!((model.confidence(0.3, &none) - 0.2).abs() < 1e-12);
    }

    // --- scorer ---

    #[test]
    fn scores_linear_combination_of_inputs() {
        let c = Criterion {
            inputs: vec![FeatureTerm::of("a"), FeatureTerm::scaled("b", -0.5)],
            ..criterion("combo", "a", 1.0)
        };
        let scorer = CriterionScorer::new(&[c], &names(&["a", "b"]), 0.5).unwrap();
        let scores = scorer.score(&features(&[("a", 0.9, false), ("b", 0.6, false)]));
        assert!((scores[0].input - 0.6).abs() < 1e-12);
        assert!((scores[0].score - 0.6).abs() < 1e-12);
        assert!((scores[0].confidence - 0.8).abs() < 1e-12);
        assert!(scores[0].insufficient.is_empty());
    }

    #[test]
    fn insufficient_input_scores_zero_with_degraded_confidence() {
        // A reversed ramp would turn the 0.0 sentinel into a perfect
        // score; the criterion must not do that.
        let c = Criterion {
            scoring: ScoringFunction::Linear {
                low: 1.0,
                high: 0.0,
            },
            ..criterion("variation", "cv", 1.0)
        };
        let scorer = CriterionScorer::new(&[c], &names(&["cv"]), 0.5).unwrap();
        let scores = scorer.score(&features(&[("cv", 0.0, true)]));
        assert!((scores[0].score).abs() < f64::EPSILON);
        assert!((scores[0].confidence - 0.4).abs() < 1e-12);
        assert_eq!(scores[0].insufficient.len(), 1);
    }

    #[test]
    fn degraded_confidence_never_exceeds_measured() {
        let models = [
            ConfidenceModel::Fixed { value: 0.7 },
            ConfidenceModel::Decisiveness {
                floor: 0.3,
                ceiling: 0.9,
            },
            ConfidenceModel::Support {
                feature: "count".to_string(),
                saturation: 10.0,
                floor: 0.2,
                ceiling: 0.8,
            },
        ];
        for model in models {
            let c = Criterion {
                confidence: model.clone(),
                ..criterion("c", "a", 1.0)
            };
            let scorer = CriterionScorer::new(&[c], &names(&["a", "count"]), 0.5).unwrap();
            for value in [0.0, 0.25, 0.5, 0.75, 1.0] {
                let measured =
                    scorer.score(&features(&[("a", value, false), ("count", 4.0, false)]));
                let degraded =
                    scorer.score(&features(&[("a", value, true), ("count", 4.0, false)]));
                assert!(
                    degraded[0].confidence < measured[0].confidence,
                    "{model:?} at {value}: {} vs {}",
                    degraded[0].confidence,
                    measured[0].confidence
                );
            }
        }
    }

    #[test]
    fn degraded_factor_must_lower_confidence() {
        for factor in [1.0, 1.5, -0.1, f64::NAN] {
            let result = CriterionScorer::new(&[criterion("c", "a", 1.0)], &names(&["a"]), factor);
            assert!(
                matches!(result, Err(PipelineError::Configuration(_))),
                "{factor}"
            );
        }
        assert!(CriterionScorer::new(&[criterion("c", "a", 1.0)], &names(&["a"]), 0.0).is_ok());
    }

    #[test]
    fn rejects_unknown_feature() {
        let result = CriterionScorer::new(&[criterion("c", "missing", 1.0)], &names(&["a"]), 0.5);
        assert!(matches!(result, Err(PipelineError::Configuration(_))));
    }

    #[test]
    fn rejects_duplicate_criterion_names() {
        let c = criterion("c", "a", 0.5);
        let result = CriterionScorer::new(&[c.clone(), c], &names(&["a"]), 0.5);
        assert!(matches!(result, Err(PipelineError::Configuration(_))));
    }

    #[test]
    fn rejects_negative_weight() {
        let result = CriterionScorer::new(&[criterion("c", "a", -0.1)], &names(&["a"]), 0.5);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_degenerate_scoring_functions() {
        let bad = [
            ScoringFunction::Linear {
                low: 1.0,
                high: 1.0,
            },
            ScoringFunction::Bands {
                steps: vec![
                    Step {
                        above: 2.0,
                        score: 0.5,
                    },
                    Step {
                        above: 1.0,
                        score: 0.9,
                    },
                ],
                below: 0.0,
            },
            ScoringFunction::Target {
                center: 0.0,
                tolerance: 0.0,
            },
            ScoringFunction::Logistic {
                midpoint: 0.0,
                steepness: 0.0,
            },
        ];
        for scoring in bad {
            let c = Criterion {
                scoring: scoring.clone(),
                ..criterion("c", "a", 1.0)
            };
            assert!(
                CriterionScorer::new(&[c], &names(&["a"]), 0.5).is_err(),
                "{scoring:?} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_out_of_range_confidence() {
        let c = Criterion {
            confidence: ConfidenceModel::Fixed { value: 1.5 },
            ..criterion("c", "a", 1.0)
        };
        assert!(CriterionScorer::new(&[c], &names(&["a"]), 0.5).is_err());
    }

    #[test]
    fn criterion_json_shape() {
        let json = r#"{
            "name": "density",
            "inputs": [{"feature": "peak_density"}],
            "scoring": {"kind": "linear", "low": 0.5, "high": 10.0},
            "weight": 0.5,
            "confidence": {"kind": "fixed", "value": 0.7}
        }"#;
        let c: Criterion = serde_json::from_str(json).unwrap();
        assert!((c.inputs[0].coefficient - 1.0).abs() < f64::EPSILON);
        assert_eq!(
            c.scoring,
            ScoringFunction::Linear {
                low: 0.5,
                high: 10.0
            }
        );
    }
}
