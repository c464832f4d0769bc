//! The analysis engine.
//!
//! [`Pipeline::new`] validates a [`PipelineConfig`] once and builds every
//! stage. The pipeline is immutable afterwards and can be shared across
//! threads; each analysis borrows it.
//!
//! [`Pipeline::analyze`] runs all stages in one call. Callers that want
//! to inspect intermediates can drive the stages one at a time instead:
//!
//! ```rust
//! # use histoscore_pipeline::{Pipeline, PipelineConfig, PipelineError, RawImage};
//! # fn run(image: &RawImage) -> Result<(), PipelineError> {
//! let pipeline = Pipeline::new(&PipelineConfig::default())?;
//! let measured = pipeline
//!     .unmix(image)?
//!     .postprocess()?
//!     .extract()?;
//! println!("{} features", measured.features().len());
//! let result = measured.score().integrate().classify();
//! # Ok(())
//! # }
//! ```
//!
//! Each stage method consumes `self` and returns the next state,
//! carrying what later stages need.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::aggregate::{CategoryBreakdown, WeightedAggregator};
use crate::classify::Classifier;
use crate::config::PipelineConfig;
use crate::ensemble::{EnsembleIntegrator, EnsembleScore};
use crate::features::{FeatureExtractor, FeatureSet};
use crate::observe::{NoopObserver, Observer, Stage, StageMetrics};
use crate::postprocess::ChannelPostProcessor;
use crate::result::DiagnosticResult;
use crate::types::{Dimensions, PipelineError, RawImage, StainChannel};
use crate::unmix::StainUnmixer;

/// A validated, immutable scoring pipeline.
#[derive(Debug, Clone)]
pub struct Pipeline {
    config: PipelineConfig,
    unmixer: StainUnmixer,
    postprocessor: ChannelPostProcessor,
    extractor: FeatureExtractor,
    aggregator: WeightedAggregator,
    integrator: EnsembleIntegrator,
    classifier: Classifier,
}

impl Pipeline {
    /// Validate `config` and build every stage.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Configuration`] describing the first
    /// violated constraint: a singular stain matrix, bad post-processing
    /// parameters, duplicate or dangling feature references, weights
    /// that do not sum to 1, or an invalid band table.
    pub fn new(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let unmixer = StainUnmixer::new(&config.unmixing)?;
        let postprocessor =
            ChannelPostProcessor::new(&config.postprocess, unmixer.max_intensity())?;
        let extractor = FeatureExtractor::new(
            &config.features,
            unmixer.channel_names(),
            config.scoring.min_population,
        )?;
        let aggregator = WeightedAggregator::new(
            &config.categories,
            &config.feature_names(),
            config.scoring.category_confidence,
            config.scoring.degraded_confidence_factor,
        )?;
        let integrator = EnsembleIntegrator::new(&config.ensemble, &aggregator)?;
        let classifier = Classifier::new(&config.classifier)?;
        Ok(Self {
            config: config.clone(),
            unmixer,
            postprocessor,
            extractor,
            aggregator,
            integrator,
            classifier,
        })
    }

    /// The configuration this pipeline was built from.
    #[must_use]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Analyze one image.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InputValidation`] for a malformed image.
    pub fn analyze(&self, image: &RawImage) -> Result<DiagnosticResult, PipelineError> {
        self.analyze_observed(image, &mut NoopObserver)
    }

    /// Analyze one image, reporting progress to `observer`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InputValidation`] for a malformed image.
    /// The observer sees no `stage_finished` for the failing stage.
    pub fn analyze_observed<O: Observer + ?Sized>(
        &self,
        image: &RawImage,
        observer: &mut O,
    ) -> Result<DiagnosticResult, PipelineError> {
        observer.stage_started(Stage::Unmix);
        let unmixed = self.unmix(image)?;
        observer.stage_finished(Stage::Unmix, &unmixed.metrics());

        observer.stage_started(Stage::PostProcess);
        let processed = unmixed.postprocess()?;
        observer.stage_finished(Stage::PostProcess, &processed.metrics());

        observer.stage_started(Stage::FeatureExtraction);
        let measured = processed.extract()?;
        observer.stage_finished(Stage::FeatureExtraction, &measured.metrics());
        for record in measured.features().insufficient() {
            observer.insufficient_data(record);
        }

        observer.stage_started(Stage::Scoring);
        let scored = measured.score();
        observer.stage_finished(Stage::Scoring, &scored.metrics());

        observer.stage_started(Stage::Ensemble);
        let integrated = scored.integrate();
        observer.stage_finished(Stage::Ensemble, &integrated.metrics());

        observer.stage_started(Stage::Classification);
        let result = integrated.classify();
        observer.stage_finished(
            Stage::Classification,
            &StageMetrics::Classification {
                label: result.label().to_string(),
                rank: result.label_rank(),
            },
        );
        Ok(result)
    }

    /// Unmix `image` into stain channels.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InputValidation`] for a malformed image.
    pub fn unmix(&self, image: &RawImage) -> Result<Unmixed<'_>, PipelineError> {
        let channels = self.unmixer.unmix(image)?;
        Ok(Unmixed {
            pipeline: self,
            dimensions: image.dimensions(),
            channels,
        })
    }
}

// ───────────────────────── Stage 1: Unmixed ──────────────────────────

/// Stain channels straight from the optical-density projection.
#[must_use = "pipeline stages are consumed by advancing; call .postprocess() to continue"]
pub struct Unmixed<'p> {
    pipeline: &'p Pipeline,
    dimensions: Dimensions,
    channels: Vec<StainChannel>,
}

impl<'p> Unmixed<'p> {
    /// The raw stain channels.
    #[must_use]
    pub fn channels(&self) -> &[StainChannel] {
        &self.channels
    }

    /// Metrics for diagnostics.
    #[must_use]
    pub fn metrics(&self) -> StageMetrics {
        StageMetrics::Unmix {
            width: self.dimensions.width,
            height: self.dimensions.height,
            channels: self.channels.len(),
        }
    }

    /// Smooth and stretch every channel.
    ///
    /// # Errors
    ///
    /// Propagates channel reconstruction errors, which cannot occur for
    /// channels produced by [`Pipeline::unmix`].
    pub fn postprocess(self) -> Result<Processed<'p>, PipelineError> {
        let channels = self
            .channels
            .into_iter()
            .map(|c| self.pipeline.postprocessor.process(c))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Processed {
            pipeline: self.pipeline,
            channels,
        })
    }
}

// ───────────────────────── Stage 2: Processed ────────────────────────

/// Smoothed, contrast-normalized stain channels.
#[must_use = "pipeline stages are consumed by advancing; call .extract() to continue"]
pub struct Processed<'p> {
    pipeline: &'p Pipeline,
    channels: Vec<StainChannel>,
}

impl<'p> Processed<'p> {
    /// The processed channels.
    #[must_use]
    pub fn channels(&self) -> &[StainChannel] {
        &self.channels
    }

    /// Metrics for diagnostics.
    #[must_use]
    pub fn metrics(&self) -> StageMetrics {
        let config = &self.pipeline.config.postprocess;
        StageMetrics::PostProcess {
            smoothing: config.smoothing,
            stretch: config.stretch,
            means: self.channels.iter().map(|c| c.stats().mean).collect(),
        }
    }

    /// Measure every declared feature.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InputValidation`] if a referenced channel
    /// is missing, which cannot happen for channels from this pipeline.
    pub fn extract(self) -> Result<Measured<'p>, PipelineError> {
        let features = self.pipeline.extractor.extract(&self.channels)?;
        Ok(Measured {
            pipeline: self.pipeline,
            channels: self.channels,
            features,
        })
    }
}

// ───────────────────────── Stage 3: Measured ─────────────────────────

/// Features measured from the processed channels.
#[must_use = "pipeline stages are consumed by advancing; call .score() to continue"]
pub struct Measured<'p> {
    pipeline: &'p Pipeline,
    channels: Vec<StainChannel>,
    features: FeatureSet,
}

impl<'p> Measured<'p> {
    /// The processed channels the features came from.
    #[must_use]
    pub fn channels(&self) -> &[StainChannel] {
        &self.channels
    }

    /// The measured features.
    #[must_use]
    pub const fn features(&self) -> &FeatureSet {
        &self.features
    }

    /// Metrics for diagnostics.
    #[must_use]
    pub fn metrics(&self) -> StageMetrics {
        StageMetrics::FeatureExtraction {
            features: self.features.len(),
            insufficient: self.features.insufficient().count(),
        }
    }

    /// Score every category.
    pub fn score(self) -> Scored<'p> {
        let categories = self.pipeline.aggregator.aggregate(&self.features);
        Scored {
            pipeline: self.pipeline,
            features: self.features,
            categories,
        }
    }
}

// ───────────────────────── Stage 4: Scored ───────────────────────────

/// Per-category scores.
#[must_use = "pipeline stages are consumed by advancing; call .integrate() to continue"]
pub struct Scored<'p> {
    pipeline: &'p Pipeline,
    features: FeatureSet,
    categories: BTreeMap<String, CategoryBreakdown>,
}

impl<'p> Scored<'p> {
    /// The measured features.
    #[must_use]
    pub const fn features(&self) -> &FeatureSet {
        &self.features
    }

    /// Category breakdowns keyed by name.
    #[must_use]
    pub const fn categories(&self) -> &BTreeMap<String, CategoryBreakdown> {
        &self.categories
    }

    /// Metrics for diagnostics.
    #[must_use]
    pub fn metrics(&self) -> StageMetrics {
        let criteria = self.categories.values().flat_map(|c| &c.criteria);
        let (total, degraded) = criteria.fold((0, 0), |(t, d), c| {
            (t + 1, d + usize::from(!c.insufficient.is_empty()))
        });
        StageMetrics::Scoring {
            categories: self.categories.len(),
            criteria: total,
            degraded_criteria: degraded,
        }
    }

    /// Blend the category scores by tier.
    pub fn integrate(self) -> Integrated<'p> {
        let ensemble = self.pipeline.integrator.integrate(&self.categories);
        Integrated {
            pipeline: self.pipeline,
            categories: self.categories,
            ensemble,
        }
    }
}

// ───────────────────────── Stage 5: Integrated ───────────────────────

/// Final score and confidence, not yet labeled.
#[must_use = "pipeline stages are consumed by advancing; call .classify() to continue"]
pub struct Integrated<'p> {
    pipeline: &'p Pipeline,
    categories: BTreeMap<String, CategoryBreakdown>,
    ensemble: EnsembleScore,
}

impl Integrated<'_> {
    /// The blended score.
    #[must_use]
    pub const fn ensemble(&self) -> &EnsembleScore {
        &self.ensemble
    }

    /// Metrics for diagnostics.
    #[must_use]
    pub const fn metrics(&self) -> StageMetrics {
        StageMetrics::Ensemble {
            final_score: self.ensemble.final_score,
            confidence: self.ensemble.confidence,
        }
    }

    /// Label the result, stamped with the current time.
    #[must_use]
    pub fn classify(self) -> DiagnosticResult {
        self.classify_at(Utc::now())
    }

    /// Label the result with an explicit timestamp.
    #[must_use]
    pub fn classify_at(self, timestamp: DateTime<Utc>) -> DiagnosticResult {
        let classification = self
            .pipeline
            .classifier
            .classify(self.ensemble.final_score);
        DiagnosticResult::new(self.ensemble, classification, self.categories, timestamp)
    }
}
