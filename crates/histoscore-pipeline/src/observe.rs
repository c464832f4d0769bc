//! Injected observation of a running analysis.
//!
//! The pipeline never logs on its own. Callers pass an [`Observer`] to
//! [`Pipeline::analyze_observed`](crate::Pipeline::analyze_observed)
//! and receive a callback around every stage plus one per
//! insufficient-data record. [`TracingObserver`] forwards these to
//! `tracing`; [`DiagnosticsRecorder`](crate::diagnostics::DiagnosticsRecorder)
//! turns them into a timing report.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::postprocess::SmoothingFilter;
use crate::types::InsufficientData;

/// The stages of one analysis, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Optical-density projection onto the stain vectors.
    Unmix,
    /// Smoothing and contrast stretch.
    PostProcess,
    /// Feature measurement.
    FeatureExtraction,
    /// Criterion scoring and per-category aggregation.
    Scoring,
    /// Tier blending.
    Ensemble,
    /// Label assignment.
    Classification,
}

impl Stage {
    /// Every stage, in execution order.
    pub const ALL: [Self; 6] = [
        Self::Unmix,
        Self::PostProcess,
        Self::FeatureExtraction,
        Self::Scoring,
        Self::Ensemble,
        Self::Classification,
    ];

    /// Short machine-readable name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unmix => "unmix",
            Self::PostProcess => "postprocess",
            Self::FeatureExtraction => "features",
            Self::Scoring => "scoring",
            Self::Ensemble => "ensemble",
            Self::Classification => "classification",
        }
    }

    /// Human-readable name for reports.
    #[must_use]
    pub const fn title(self) -> &'static str {
        match self {
            Self::Unmix => "Stain Unmixing",
            Self::PostProcess => "Post-processing",
            Self::FeatureExtraction => "Feature Extraction",
            Self::Scoring => "Scoring",
            Self::Ensemble => "Ensemble",
            Self::Classification => "Classification",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage-specific metrics reported when a stage finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StageMetrics {
    /// Stain unmixing.
    Unmix {
        /// Image width in pixels.
        width: u32,
        /// Image height in pixels.
        height: u32,
        /// Number of stain channels produced.
        channels: usize,
    },
    /// Channel post-processing.
    PostProcess {
        /// Smoothing filter applied.
        smoothing: SmoothingFilter,
        /// Whether the contrast stretch was enabled.
        stretch: bool,
        /// Channel means after processing, in channel order.
        means: Vec<f64>,
    },
    /// Feature measurement.
    FeatureExtraction {
        /// Number of features measured.
        features: usize,
        /// Number of features lacking data.
        insufficient: usize,
    },
    /// Criterion scoring and aggregation.
    Scoring {
        /// Number of categories scored.
        categories: usize,
        /// Number of criteria evaluated.
        criteria: usize,
        /// Number of criteria that scored on insufficient data.
        degraded_criteria: usize,
    },
    /// Tier blending.
    Ensemble {
        /// Final score.
        final_score: f64,
        /// Final confidence.
        confidence: f64,
    },
    /// Label assignment.
    Classification {
        /// Assigned label.
        label: String,
        /// Label rank.
        rank: usize,
    },
}

/// Receives progress callbacks from an analysis.
///
/// Every method has an empty default so implementations override only
/// what they need.
pub trait Observer {
    /// A stage is about to run.
    fn stage_started(&mut self, stage: Stage) {
        let _ = stage;
    }

    /// A stage completed successfully.
    fn stage_finished(&mut self, stage: Stage, metrics: &StageMetrics) {
        let _ = (stage, metrics);
    }

    /// A feature lacked data. Called once per insufficient feature,
    /// after feature extraction.
    fn insufficient_data(&mut self, record: &InsufficientData) {
        let _ = record;
    }
}

/// Ignores every callback.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl Observer for NoopObserver {}

/// Emits structured `tracing` events.
///
/// Stage starts are `trace`, stage completions `debug`, the final
/// classification `info`, and insufficient data `warn`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn stage_started(&mut self, stage: Stage) {
        tracing::trace!(stage = stage.as_str(), "stage started");
    }

    fn stage_finished(&mut self, stage: Stage, metrics: &StageMetrics) {
        match metrics {
            StageMetrics::Unmix {
                width,
                height,
                channels,
            } => tracing::debug!(stage = stage.as_str(), width, height, channels, "stage finished"),
            StageMetrics::PostProcess {
                smoothing,
                stretch,
                means,
            } => tracing::debug!(
                stage = stage.as_str(),
                ?smoothing,
                stretch,
                ?means,
                "stage finished"
            ),
            StageMetrics::FeatureExtraction {
                features,
                insufficient,
            } => tracing::debug!(stage = stage.as_str(), features, insufficient, "stage finished"),
            StageMetrics::Scoring {
                categories,
                criteria,
                degraded_criteria,
            } => tracing::debug!(
                stage = stage.as_str(),
                categories,
                criteria,
                degraded_criteria,
                "stage finished"
            ),
            StageMetrics::Ensemble {
                final_score,
                confidence,
            } => tracing::debug!(stage = stage.as_str(), final_score, confidence, "stage finished"),
            StageMetrics::Classification { label, rank } => {
                tracing::info!(stage = stage.as_str(), label = label.as_str(), rank, "classified");
            }
        }
    }

    fn insufficient_data(&mut self, record: &InsufficientData) {
        tracing::warn!(
            feature = record.feature.as_str(),
            population = record.population,
            required = record.required,
            "insufficient data"
        );
    }
}

impl<O: Observer + ?Sized> Observer for &mut O {
    fn stage_started(&mut self, stage: Stage) {
        (**self).stage_started(stage);
    }

    fn stage_finished(&mut self, stage: Stage, metrics: &StageMetrics) {
        (**self).stage_finished(stage, metrics);
    }

    fn insufficient_data(&mut self, record: &InsufficientData) {
        (**self).insufficient_data(record);
    }
}

/// Both observers see every callback, first `A` then `B`.
impl<A: Observer, B: Observer> Observer for (A, B) {
    fn stage_started(&mut self, stage: Stage) {
        self.0.stage_started(stage);
        self.1.stage_started(stage);
    }

    fn stage_finished(&mut self, stage: Stage, metrics: &StageMetrics) {
        self.0.stage_finished(stage, metrics);
        self.1.stage_finished(stage, metrics);
    }

    fn insufficient_data(&mut self, record: &InsufficientData) {
        self.0.insufficient_data(record);
        self.1.insufficient_data(record);
    }
}
