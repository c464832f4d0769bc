//! histoscore-pipeline: configurable morphometric scoring (sans-IO).
//!
//! Scores a stained tissue image through:
//! stain unmixing -> channel post-processing -> feature extraction ->
//! criterion scoring -> per-category aggregation -> two-tier ensemble ->
//! threshold classification.
//!
//! Everything the engine knows about a tissue type (stain vectors,
//! features, criteria, weights, label bands) is data in
//! [`PipelineConfig`]. [`Pipeline::new`] validates it once; the
//! resulting [`Pipeline`] is immutable and may be shared across
//! threads.
//!
//! This crate has **no I/O dependencies**: it operates on in-memory
//! pixel buffers and returns structured data. It never logs on its own;
//! pass an [`Observer`] (for example [`TracingObserver`]) to
//! [`Pipeline::analyze_observed`] to see progress.

pub mod aggregate;
pub mod classify;
pub mod config;
pub mod criteria;
pub mod diagnostics;
pub mod ensemble;
pub mod features;
pub mod observe;
pub mod pipeline;
pub mod postprocess;
pub mod result;
pub mod types;
pub mod unmix;

pub use aggregate::{CategoryBreakdown, CategoryConfig, Tier, WeightedAggregator};
pub use classify::{Band, Classification, Classifier, ClassifierConfig};
pub use config::{PipelineConfig, ScoringConfig};
pub use criteria::{ConfidenceModel, Criterion, CriterionScore, FeatureTerm, ScoringFunction};
pub use ensemble::{EnsembleConfig, EnsembleIntegrator, TierScore};
pub use features::{FeatureExtractor, FeatureKind, FeatureSet, FeatureSpec};
pub use observe::{NoopObserver, Observer, Stage, StageMetrics, TracingObserver};
pub use pipeline::Pipeline;
pub use postprocess::{ChannelPostProcessor, PostProcessConfig, SmoothingFilter};
pub use result::DiagnosticResult;
pub use types::{
    ChannelStats, Dimensions, InsufficientData, PipelineError, RawImage, StainChannel,
};
pub use unmix::{StainUnmixer, StainVector, UnmixingConfig};

/// Build a pipeline from `config` and analyze one image.
///
/// Convenient for one-off calls; when scoring many images, build the
/// [`Pipeline`] once and reuse it.
///
/// # Errors
///
/// Returns [`PipelineError::Configuration`] if `config` is invalid and
/// [`PipelineError::InputValidation`] if `image` is malformed.
pub fn analyze(image: &RawImage, config: &PipelineConfig) -> Result<DiagnosticResult, PipelineError> {
    Pipeline::new(config)?.analyze(image)
}

/// Decode encoded image bytes and analyze them.
///
/// # Errors
///
/// Returns [`PipelineError::InputValidation`] for empty or undecodable
/// bytes and [`PipelineError::Configuration`] for an invalid `config`.
pub fn analyze_encoded(
    image_bytes: &[u8],
    config: &PipelineConfig,
) -> Result<DiagnosticResult, PipelineError> {
    let pipeline = Pipeline::new(config)?;
    let image = RawImage::decode(image_bytes)?;
    pipeline.analyze(&image)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    /// Encode an RGBA image as PNG.
    fn png(img: &image::RgbaImage) -> Vec<u8> {
        let mut buf = Vec::new();
        let encoder = image::codecs::png::PngEncoder::new(&mut buf);
        image::ImageEncoder::write_image(
            encoder,
            img.as_raw(),
            img.width(),
            img.height(),
            image::ExtendedColorType::Rgba8,
        )
        .unwrap();
        buf
    }

    /// Pink stroma with scattered dark nuclei.
    fn tissue_png(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbaImage::from_fn(width, height, |x, y| {
            if (x % 9 < 3) && (y % 7 < 3) {
                image::Rgba([60, 30, 120, 255])
            } else {
                image::Rgba([230, 120, 200, 255])
            }
        });
        png(&img)
    }

    #[test]
    fn analyze_empty_input() {
        let result = analyze_encoded(&[], &PipelineConfig::default());
        assert!(matches!(result, Err(PipelineError::InputValidation(_))));
    }

    #[test]
    fn analyze_corrupt_input() {
        let result = analyze_encoded(&[0xFF, 0x00], &PipelineConfig::default());
        assert!(matches!(result, Err(PipelineError::InputValidation(_))));
    }

    #[test]
    fn analyze_encoded_tissue_produces_result() {
        let result = analyze_encoded(&tissue_png(45, 42), &PipelineConfig::default());
        assert!(result.is_ok(), "expected Ok, got {result:?}");
        let result = result.unwrap();
        assert!((0.0..=1.0).contains(&result.final_score()));
        assert!(!result.label().is_empty());
        assert_eq!(result.categories().len(), 4);
    }

    #[test]
    fn invalid_config_is_reported_before_decoding() {
        let config = PipelineConfig {
            ensemble: EnsembleConfig {
                morphometric_weight: 0.9,
                pattern_weight: 0.3,
                ..EnsembleConfig::default()
            },
            ..PipelineConfig::default()
        };
        let result = analyze_encoded(&[], &config);
        assert!(matches!(result, Err(PipelineError::Configuration(_))));
    }

    #[test]
    fn decoded_and_raw_images_agree() {
        let bytes = tissue_png(27, 21);
        let decoded = RawImage::decode(&bytes).unwrap();
        let config = PipelineConfig::default();
        let a = analyze(&decoded, &config).unwrap();
        let b = analyze_encoded(&bytes, &config).unwrap();
        assert!((a.final_score() - b.final_score()).abs() < f64::EPSILON);
        assert_eq!(a.label(), b.label());
    }

    #[test]
    fn result_serializes_with_expected_fields() {
        let image = RawImage::uniform(8, 8, [200, 150, 230, 255]).unwrap();
        let result = analyze(&image, &PipelineConfig::default()).unwrap();
        let json = serde_json::to_value(&result).unwrap();
        for key in [
            "final_score",
            "confidence",
            "label",
            "label_rank",
            "tiers",
            "categories",
            "timestamp",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
        let category = &json["categories"]["cellularity"];
        assert!(category["features"].is_object());
        assert_eq!(category["tier"], "morphometric");
        assert!(json["tiers"]["pattern"]["score"].is_f64());
        let back: DiagnosticResult = serde_json::from_value(json).unwrap();
        assert_eq!(back.label(), result.label());
        assert_eq!(back.timestamp(), result.timestamp());
        assert!((back.final_score() - result.final_score()).abs() < 1e-12);
    }
}
