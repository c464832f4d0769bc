//! Analysis diagnostics: timing and metrics for each stage.
//!
//! [`DiagnosticsRecorder`] is an [`Observer`] that timestamps every
//! stage through an injected [`Clock`], so the core crate never reads
//! the system time itself. [`analyze_with_diagnostics`] runs one
//! analysis and returns the result alongside its diagnostics.
//!
//! Durations are serialized as fractional seconds (`f64`) for JSON
//! compatibility, since `std::time::Duration` does not implement serde
//! traits.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::observe::{Observer, Stage, StageMetrics};
use crate::pipeline::Pipeline;
use crate::result::DiagnosticResult;
use crate::types::{InsufficientData, PipelineError, RawImage};

/// Serde support for `std::time::Duration` as fractional seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Serialize a `Duration` as fractional seconds (`f64`).
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    /// Deserialize a `Duration` from fractional seconds (`f64`).
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(
                "duration seconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }
}

/// Monotonic time source.
pub trait Clock {
    /// Opaque point in time.
    type Instant;

    /// The current instant.
    fn now(&self) -> Self::Instant;

    /// Time elapsed since `since`.
    fn elapsed(&self, since: &Self::Instant) -> Duration;
}

/// Diagnostics for a single stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDiagnostics {
    /// Which stage.
    pub stage: Stage,
    /// Wall-clock duration of this stage (seconds).
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    /// Stage-specific metrics.
    pub metrics: StageMetrics,
}

/// High-level summary of one analysis.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisSummary {
    /// Image width in pixels.
    pub image_width: u32,
    /// Image height in pixels.
    pub image_height: u32,
    /// Number of features measured.
    pub feature_count: usize,
    /// Insufficient-data records seen.
    pub insufficient: Vec<InsufficientData>,
    /// Final score.
    pub final_score: f64,
    /// Final confidence.
    pub confidence: f64,
    /// Assigned label.
    pub label: String,
}

/// Diagnostics collected from one analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisDiagnostics {
    /// Completed stages, in execution order.
    pub stages: Vec<StageDiagnostics>,
    /// Total wall-clock duration (seconds).
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
    /// Summary values.
    pub summary: AnalysisSummary,
}

impl AnalysisDiagnostics {
    /// Duration of `stage`, if it ran.
    #[must_use]
    pub fn stage_duration(&self, stage: Stage) -> Option<Duration> {
        self.stages
            .iter()
            .find(|s| s.stage == stage)
            .map(|s| s.duration)
    }

    /// Format diagnostics as a human-readable report.
    #[must_use]
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("Analysis Diagnostics Report\n{}", "=".repeat(60)));
        lines.push(format!(
            "Image: {}x{}",
            self.summary.image_width, self.summary.image_height,
        ));
        lines.push(format!(
            "Total duration: {:.3}ms",
            duration_ms(self.total_duration),
        ));
        lines.push(String::new());

        lines.push(format!(
            "{:<24} {:>10} {:>10}  {}",
            "Stage", "Duration", "% Total", "Details"
        ));
        lines.push("-".repeat(80));

        let total_ms = duration_ms(self.total_duration);
        for diag in &self.stages {
            let ms = duration_ms(diag.duration);
            let pct = if total_ms > 0.0 {
                ms / total_ms * 100.0
            } else {
                0.0
            };
            let details = format_metrics(&diag.metrics);
            lines.push(format!(
                "{:<24} {ms:>8.3}ms {pct:>9.1}%  {details}",
                diag.stage.title()
            ));
        }

        lines.push(String::new());
        lines.push(format!(
            "Score: {:.4}  |  Confidence: {:.4}  |  Label: {}",
            self.summary.final_score, self.summary.confidence, self.summary.label,
        ));
        for record in &self.summary.insufficient {
            lines.push(format!("Insufficient: {record}"));
        }

        lines.join("\n")
    }
}

/// Convert a `Duration` to milliseconds as `f64`.
fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Format stage metrics into a compact detail string.
fn format_metrics(metrics: &StageMetrics) -> String {
    match metrics {
        StageMetrics::Unmix {
            width,
            height,
            channels,
        } => format!("{width}x{height} -> {channels} channels"),
        StageMetrics::PostProcess {
            smoothing,
            stretch,
            means,
        } => {
            let means: Vec<String> = means.iter().map(|m| format!("{m:.3}")).collect();
            format!(
                "smoothing={smoothing:?} stretch={stretch} means=[{}]",
                means.join(", ")
            )
        }
        StageMetrics::FeatureExtraction {
            features,
            insufficient,
        } => format!("{features} features ({insufficient} insufficient)"),
        StageMetrics::Scoring {
            categories,
            criteria,
            degraded_criteria,
        } => format!("{categories} categories, {criteria} criteria ({degraded_criteria} degraded)"),
        StageMetrics::Ensemble {
            final_score,
            confidence,
        } => format!("score={final_score:.4} confidence={confidence:.4}"),
        StageMetrics::Classification { label, rank } => format!("{label} (rank {rank})"),
    }
}

/// Collects [`AnalysisDiagnostics`] from observer callbacks.
pub struct DiagnosticsRecorder<'c, C: Clock> {
    clock: &'c C,
    started: Option<C::Instant>,
    stage_started: Option<C::Instant>,
    stages: Vec<StageDiagnostics>,
    summary: AnalysisSummary,
}

impl<'c, C: Clock> DiagnosticsRecorder<'c, C> {
    /// A recorder timing with `clock`.
    pub fn new(clock: &'c C) -> Self {
        Self {
            clock,
            started: None,
            stage_started: None,
            stages: Vec::new(),
            summary: AnalysisSummary::default(),
        }
    }

    /// Stop recording and return the diagnostics.
    #[must_use]
    pub fn finish(self) -> AnalysisDiagnostics {
        let total_duration = self
            .started
            .as_ref()
            .map_or(Duration::ZERO, |start| self.clock.elapsed(start));
        AnalysisDiagnostics {
            stages: self.stages,
            total_duration,
            summary: self.summary,
        }
    }
}

impl<C: Clock> Observer for DiagnosticsRecorder<'_, C> {
    fn stage_started(&mut self, _stage: Stage) {
        if self.started.is_none() {
            self.started = Some(self.clock.now());
        }
        self.stage_started = Some(self.clock.now());
    }

    fn stage_finished(&mut self, stage: Stage, metrics: &StageMetrics) {
        let duration = self
            .stage_started
            .take()
            .map_or(Duration::ZERO, |start| self.clock.elapsed(&start));
        match metrics {
            StageMetrics::Unmix { width, height, .. } => {
                self.summary.image_width = *width;
                self.summary.image_height = *height;
            }
            StageMetrics::FeatureExtraction { features, .. } => {
                self.summary.feature_count = *features;
            }
            StageMetrics::Ensemble {
                final_score,
                confidence,
            } => {
                self.summary.final_score = *final_score;
                self.summary.confidence = *confidence;
            }
            StageMetrics::Classification { label, .. } => {
                self.summary.label.clone_from(label);
            }
            StageMetrics::PostProcess { .. } | StageMetrics::Scoring { .. } => {}
        }
        self.stages.push(StageDiagnostics {
            stage,
            duration,
            metrics: metrics.clone(),
        });
    }

    fn insufficient_data(&mut self, record: &InsufficientData) {
        self.summary.insufficient.push(record.clone());
    }
}

/// Run one analysis, collecting diagnostics timed by `clock`.
///
/// # Errors
///
/// Propagates any [`PipelineError`] from the analysis.
pub fn analyze_with_diagnostics<C: Clock>(
    pipeline: &Pipeline,
    image: &RawImage,
    clock: &C,
) -> Result<(DiagnosticResult, AnalysisDiagnostics), PipelineError> {
    let mut recorder = DiagnosticsRecorder::new(clock);
    let result = pipeline.analyze_observed(image, &mut recorder)?;
    Ok((result, recorder.finish()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::config::PipelineConfig;

    /// Advances one millisecond per reading.
    struct StepClock {
        ticks: Cell<u64>,
    }

    impl StepClock {
        const fn new() -> Self {
            Self {
                ticks: Cell::new(0),
            }
        }
    }

    impl Clock for StepClock {
        type Instant = u64;

        fn now(&self) -> u64 {
            let t = self.ticks.get();
            self.ticks.set(t + 1);
            t
        }

        fn elapsed(&self, since: &u64) -> Duration {
            Duration::from_millis(self.now() - since)
        }
    }

    fn sample_image() -> RawImage {
        RawImage::uniform(16, 16, [200, 150, 230, 255]).unwrap()
    }

    #[test]
    fn records_every_stage_in_order() {
        let pipeline = Pipeline::new(&PipelineConfig::default()).unwrap();
        let clock = StepClock::new();
        let (result, diagnostics) =
            analyze_with_diagnostics(&pipeline, &sample_image(), &clock).unwrap();
        let stages: Vec<Stage> = diagnostics.stages.iter().map(|s| s.stage).collect();
        assert_eq!(stages, Stage::ALL);
        assert!(diagnostics.stages.iter().all(|s| s.duration > Duration::ZERO));
        assert!(diagnostics.total_duration >= diagnostics.stages[0].duration);
        assert_eq!(diagnostics.summary.label, result.label());
        assert_eq!(diagnostics.summary.image_width, 16);
    }

    #[test]
    fn report_mentions_every_stage() {
        let pipeline = Pipeline::new(&PipelineConfig::default()).unwrap();
        let (_, diagnostics) =
            analyze_with_diagnostics(&pipeline, &sample_image(), &StepClock::new()).unwrap();
        let report = diagnostics.report();
        for stage in Stage::ALL {
            assert!(report.contains(stage.title()), "missing {stage}");
        }
        assert!(diagnostics.stage_duration(Stage::Scoring).is_some());
    }

    #[test]
    fn diagnostics_serialize_durations_as_seconds() {
        let pipeline = Pipeline::new(&PipelineConfig::default()).unwrap();
        let (_, diagnostics) =
            analyze_with_diagnostics(&pipeline, &sample_image(), &StepClock::new()).unwrap();
        let json = serde_json::to_value(&diagnostics).unwrap();
        assert!(json["total_duration"].is_f64());
        assert!(json["stages"][0]["duration"].as_f64().unwrap() > 0.0);
    }
}
