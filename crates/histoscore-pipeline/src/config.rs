//! Pipeline configuration and the built-in scoring profile.
//!
//! Every number the pipeline uses lives here. The whole structure is
//! serde-serializable so profiles can be kept as JSON and loaded at
//! startup; [`PipelineConfig::default`] is a generic H&E profile.
//! Nothing is validated until [`Pipeline::new`](crate::Pipeline::new).

use serde::{Deserialize, Serialize};

use crate::aggregate::{CategoryConfig, ConfidenceShaping, Tier};
use crate::classify::ClassifierConfig;
use crate::criteria::{ConfidenceModel, Criterion, FeatureTerm, ScoringFunction, Step};
use crate::ensemble::EnsembleConfig;
use crate::features::{DEFAULT_MIN_POPULATION, FeatureKind, FeatureSpec, Neighborhood, Statistic};
use crate::postprocess::PostProcessConfig;
use crate::unmix::UnmixingConfig;

/// Scoring knobs shared by every category.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Minimum population for dispersion features.
    pub min_population: usize,
    /// Multiplier applied to a criterion's confidence when one of its
    /// inputs lacks data.
    pub degraded_confidence_factor: f64,
    /// Category confidence boost and cap.
    pub category_confidence: ConfidenceShaping,
}

impl ScoringConfig {
    /// Default degraded-confidence multiplier.
    pub const DEFAULT_DEGRADED_CONFIDENCE_FACTOR: f64 = 0.5;
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            min_population: DEFAULT_MIN_POPULATION,
            degraded_confidence_factor: Self::DEFAULT_DEGRADED_CONFIDENCE_FACTOR,
            category_confidence: ConfidenceShaping::default(),
        }
    }
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Stain vectors and optical-density parameters.
    pub unmixing: UnmixingConfig,
    /// Smoothing and contrast stretch.
    pub postprocess: PostProcessConfig,
    /// Declared features.
    pub features: Vec<FeatureSpec>,
    /// Scoring categories and their criteria.
    pub categories: Vec<CategoryConfig>,
    /// Shared scoring knobs.
    pub scoring: ScoringConfig,
    /// Tier weights.
    pub ensemble: EnsembleConfig,
    /// Label bands.
    pub classifier: ClassifierConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            unmixing: UnmixingConfig::default(),
            postprocess: PostProcessConfig::default(),
            features: default_features(),
            categories: default_categories(),
            scoring: ScoringConfig::default(),
            ensemble: EnsembleConfig::default(),
            classifier: ClassifierConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Names of the declared features, in order.
    #[must_use]
    pub fn feature_names(&self) -> Vec<String> {
        self.features.iter().map(|f| f.name.clone()).collect()
    }
}

const PRIMARY: &str = "primary";
const SECONDARY: &str = "secondary";

/// Tissue is any pixel whose summed stain intensity exceeds this.
const TISSUE_CUTOFF: f32 = 0.3;
/// Nuclear peaks must exceed this primary intensity.
const PEAK_CUTOFF: f32 = 1.8;
/// Nuclear regions are primary pixels above this.
const STRUCTURE_CUTOFF: f32 = 1.5;

fn feature(name: &str, kind: FeatureKind) -> FeatureSpec {
    FeatureSpec::new(name, kind)
}

fn default_features() -> Vec<FeatureSpec> {
    let primary = || PRIMARY.to_string();
    vec![
        feature(
            "tissue_fraction",
            FeatureKind::TissueFraction {
                cutoff: TISSUE_CUTOFF,
            },
        ),
        feature(
            "primary_density",
            FeatureKind::Density {
                channel: primary(),
                cutoff: STRUCTURE_CUTOFF,
            },
        ),
        feature(
            "secondary_density",
            FeatureKind::Density {
                channel: SECONDARY.to_string(),
                cutoff: 1.0,
            },
        ),
        feature(
            "primary_mean",
            FeatureKind::ChannelStat {
                channel: primary(),
                statistic: Statistic::Mean,
            },
        ),
        feature(
            "primary_cv",
            FeatureKind::ChannelStat {
                channel: primary(),
                statistic: Statistic::Cv,
            },
        ),
        feature(
            "structure_count",
            FeatureKind::PeakCount {
                channel: primary(),
                neighborhood: Neighborhood::FiveByFive,
                min_intensity: PEAK_CUTOFF,
            },
        ),
        feature(
            "structure_density",
            FeatureKind::PeakDensity {
                channel: primary(),
                neighborhood: Neighborhood::FiveByFive,
                min_intensity: PEAK_CUTOFF,
                tissue_cutoff: TISSUE_CUTOFF,
                per_pixels: 1000.0,
            },
        ),
        feature(
            "peak_intensity_cv",
            FeatureKind::PeakDispersion {
                channel: primary(),
                neighborhood: Neighborhood::FiveByFive,
                min_intensity: PEAK_CUTOFF,
                statistic: Statistic::Cv,
            },
        ),
        feature(
            "structure_area_mean",
            FeatureKind::StructureArea {
                channel: primary(),
                cutoff: STRUCTURE_CUTOFF,
                statistic: Statistic::Mean,
            },
        ),
        feature(
            "structure_area_cv",
            FeatureKind::StructureArea {
                channel: primary(),
                cutoff: STRUCTURE_CUTOFF,
                statistic: Statistic::Cv,
            },
        ),
        feature(
            "stain_ratio",
            FeatureKind::Ratio {
                numerator: primary(),
                denominator: SECONDARY.to_string(),
            },
        ),
    ]
}

fn linear(low: f64, high: f64) -> ScoringFunction {
    ScoringFunction::Linear { low, high }
}

fn support(floor: f64, ceiling: f64) -> ConfidenceModel {
    ConfidenceModel::Support {
        feature: "structure_count".to_string(),
        saturation: 30.0,
        floor,
        ceiling,
    }
}

fn criterion(
    name: &str,
    inputs: Vec<FeatureTerm>,
    scoring: ScoringFunction,
    weight: f64,
    confidence: ConfidenceModel,
) -> Criterion {
    Criterion {
        name: name.to_string(),
        inputs,
        scoring,
        weight,
        confidence,
    }
}

fn default_categories() -> Vec<CategoryConfig> {
    vec![
        CategoryConfig {
            name: "cellularity".to_string(),
            tier: Tier::Morphometric,
            weight: 0.4,
            criteria: vec![
                criterion(
                    "structure_density",
                    vec![FeatureTerm::of("structure_density")],
                    linear(0.5, 10.0),
                    0.5,
                    support(0.4, 0.9),
                ),
                criterion(
                    "primary_density",
                    vec![FeatureTerm::of("primary_density")],
                    linear(0.05, 0.5),
                    0.3,
                    ConfidenceModel::Decisiveness {
                        floor: 0.5,
                        ceiling: 0.9,
                    },
                ),
                criterion(
                    "stain_balance",
                    vec![FeatureTerm::of("stain_ratio")],
                    linear(0.8, 3.0),
                    0.2,
                    ConfidenceModel::Fixed { value: 0.7 },
                ),
            ],
        },
        CategoryConfig {
            name: "pleomorphism".to_string(),
            tier: Tier::Morphometric,
            weight: 0.6,
            criteria: vec![
                criterion(
                    "area_variation",
                    vec![FeatureTerm::of("structure_area_cv")],
                    linear(0.2, 1.2),
                    0.4,
                    support(0.4, 0.9),
                ),
                criterion(
                    "intensity_variation",
                    vec![FeatureTerm::of("peak_intensity_cv")],
                    linear(0.05, 0.4),
                    0.35,
                    support(0.4, 0.85),
                ),
                criterion(
                    "structure_size",
                    vec![FeatureTerm::of("structure_area_mean")],
                    ScoringFunction::Bands {
                        steps: vec![
                            Step {
                                above: 20.0,
                                score: 0.3,
                            },
                            Step {
                                above: 60.0,
                                score: 0.6,
                            },
                            Step {
                                above: 150.0,
                                score: 0.9,
                            },
                        ],
                        below: 0.1,
                    },
                    0.25,
                    ConfidenceModel::Decisiveness {
                        floor: 0.5,
                        ceiling: 0.85,
                    },
                ),
            ],
        },
        CategoryConfig {
            name: "chromatin_texture".to_string(),
            tier: Tier::Pattern,
            weight: 0.5,
            criteria: vec![
                criterion(
                    "heterogeneity",
                    vec![FeatureTerm::of("primary_cv")],
                    ScoringFunction::Logistic {
                        midpoint: 0.8,
                        steepness: 4.0,
                    },
                    0.6,
                    ConfidenceModel::Decisiveness {
                        floor: 0.45,
                        ceiling: 0.85,
                    },
                ),
                criterion(
                    "hyperchromasia",
                    vec![FeatureTerm::of("primary_mean")],
                    linear(0.3, 2.0),
                    0.4,
                    ConfidenceModel::Fixed { value: 0.65 },
                ),
            ],
        },
        CategoryConfig {
            name: "stromal_pattern".to_string(),
            tier: Tier::Pattern,
            weight: 0.5,
            criteria: vec![
                criterion(
                    "stromal_loss",
                    vec![
                        FeatureTerm::of("tissue_fraction"),
                        FeatureTerm::scaled("secondary_density", -1.0),
                    ],
                    linear(0.0, 0.8),
                    0.5,
                    ConfidenceModel::Decisiveness {
                        floor: 0.4,
                        ceiling: 0.8,
                    },
                ),
                criterion(
                    "coverage",
                    vec![FeatureTerm::of("tissue_fraction")],
                    ScoringFunction::Target {
                        center: 0.9,
                        tolerance: 0.6,
                    },
                    0.5,
                    ConfidenceModel::Fixed { value: 0.6 },
                ),
            ],
        },
    ]
}
