//! Feature extraction: named scalar measurements over stain channels.
//!
//! The module has two layers:
//!
//! - Pure measurement functions ([`density`], [`local_maxima`],
//!   [`structure_areas`], [`dispersion`], [`ratio`], ...). Same inputs,
//!   same outputs, no hidden state.
//! - [`FeatureExtractor`], which evaluates a declarative list of
//!   [`FeatureSpec`]s into a [`FeatureSet`].
//!
//! # Insufficient data
//!
//! Statistics over an empty or too-small population (no detected
//! structures, no tissue, a zero denominator) never divide by zero and
//! never produce NaN. The feature takes the value
//! [`INSUFFICIENT_SENTINEL`] and carries an [`InsufficientData`] record
//! describing the shortfall.

use std::collections::BTreeMap;

use image::{GrayImage, Luma};
use imageproc::region_labelling::{Connectivity, connected_components};
use serde::{Deserialize, Serialize};

use crate::types::{ChannelStats, InsufficientData, PipelineError, StainChannel};

/// Value reported by a feature whose population is too small.
pub const INSUFFICIENT_SENTINEL: f64 = 0.0;

/// Default minimum population for dispersion statistics.
pub const DEFAULT_MIN_POPULATION: usize = 3;

/// Denominator means below this make a ratio insufficient.
pub const RATIO_EPSILON: f64 = 1e-9;

/// Window used by the local-maximum test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Neighborhood {
    /// 3x3 window (radius 1).
    #[default]
    #[serde(rename = "3x3")]
    ThreeByThree,
    /// 5x5 window (radius 2).
    #[serde(rename = "5x5")]
    FiveByFive,
}

impl Neighborhood {
    /// Window radius in pixels.
    #[must_use]
    pub const fn radius(self) -> u32 {
        match self {
            Self::ThreeByThree => 1,
            Self::FiveByFive => 2,
        }
    }
}

/// Summary statistic selected from a population.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Statistic {
    /// Arithmetic mean.
    Mean,
    /// Population standard deviation.
    Std,
    /// Coefficient of variation (`std / mean`).
    Cv,
    /// Smallest member.
    Min,
    /// Largest member.
    Max,
}

/// What a feature measures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeatureKind {
    /// Fraction of pixels with intensity `> cutoff`.
    Density {
        /// Source channel.
        channel: String,
        /// Intensity cutoff (OD units).
        cutoff: f32,
    },
    /// Fraction of pixels whose summed stain intensity is `> cutoff`.
    TissueFraction {
        /// Summed-intensity cutoff (OD units).
        cutoff: f32,
    },
    /// A summary statistic of a whole channel.
    ChannelStat {
        /// Source channel.
        channel: String,
        /// Statistic to report.
        statistic: Statistic,
    },
    /// Number of local maxima (candidate structure centers).
    PeakCount {
        /// Source channel.
        channel: String,
        /// Window for the maximum test.
        #[serde(default)]
        neighborhood: Neighborhood,
        /// Peaks must be strictly above this intensity.
        min_intensity: f32,
    },
    /// Local maxima per `per_pixels` tissue pixels.
    PeakDensity {
        /// Source channel.
        channel: String,
        /// Window for the maximum test.
        #[serde(default)]
        neighborhood: Neighborhood,
        /// Peaks must be strictly above this intensity.
        min_intensity: f32,
        /// Summed-intensity cutoff defining tissue pixels.
        tissue_cutoff: f32,
        /// Normalization area in pixels.
        per_pixels: f64,
    },
    /// Dispersion of peak intensities.
    PeakDispersion {
        /// Source channel.
        channel: String,
        /// Window for the maximum test.
        #[serde(default)]
        neighborhood: Neighborhood,
        /// Peaks must be strictly above this intensity.
        min_intensity: f32,
        /// Statistic to report.
        statistic: Statistic,
    },
    /// Dispersion of the areas of 8-connected regions above `cutoff`.
    StructureArea {
        /// Source channel.
        channel: String,
        /// Intensity cutoff (OD units).
        cutoff: f32,
        /// Statistic to report.
        statistic: Statistic,
    },
    /// Ratio of two channel means.
    Ratio {
        /// Numerator channel.
        numerator: String,
        /// Denominator channel.
        denominator: String,
    },
}

impl FeatureKind {
    /// Channels this feature reads. Empty for all-channel features.
    fn channels(&self) -> Vec<&str> {
        match self {
            Self::TissueFraction { .. } => Vec::new(),
            Self::Density { channel, .. }
            | Self::ChannelStat { channel, .. }
            | Self::PeakCount { channel, .. }
            | Self::PeakDensity { channel, .. }
            | Self::PeakDispersion { channel, .. }
            | Self::StructureArea { channel, .. } => vec![channel.as_str()],
            Self::Ratio {
                numerator,
                denominator,
            } => vec![numerator.as_str(), denominator.as_str()],
        }
    }

    /// Intensity cutoffs this feature uses, for validation.
    fn cutoffs(&self) -> Vec<f32> {
        match *self {
            Self::Density { cutoff, .. }
            | Self::TissueFraction { cutoff }
            | Self::StructureArea { cutoff, .. } => vec![cutoff],
            Self::PeakCount { min_intensity, .. } | Self::PeakDispersion { min_intensity, .. } => {
                vec![min_intensity]
            }
            Self::PeakDensity {
                min_intensity,
                tissue_cutoff,
                ..
            } => vec![min_intensity, tissue_cutoff],
            Self::ChannelStat { .. } | Self::Ratio { .. } => Vec::new(),
        }
    }
}

/// A named feature declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSpec {
    /// Unique feature name referenced by criteria.
    pub name: String,
    /// The measurement.
    #[serde(flatten)]
    pub kind: FeatureKind,
}

impl FeatureSpec {
    /// Create a feature declaration.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: FeatureKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// One measured feature value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    /// Measured value, or [`INSUFFICIENT_SENTINEL`].
    pub value: f64,
    /// Present when the population was too small.
    pub insufficient: Option<InsufficientData>,
}

impl Feature {
    const fn measured(value: f64) -> Self {
        Self {
            value,
            insufficient: None,
        }
    }

    fn insufficient(feature: &str, population: usize, required: usize) -> Self {
        Self {
            value: INSUFFICIENT_SENTINEL,
            insufficient: Some(InsufficientData {
                feature: feature.to_string(),
                population,
                required,
            }),
        }
    }

    /// Whether the value is the insufficient-data sentinel.
    #[must_use]
    pub const fn is_insufficient(&self) -> bool {
        self.insufficient.is_some()
    }
}

/// All features measured for one image. Immutable once built.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureSet(BTreeMap<String, Feature>);

impl FeatureSet {
    /// Look up a feature.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Feature> {
        self.0.get(name)
    }

    /// Value of a feature, if it was measured.
    #[must_use]
    pub fn value(&self, name: &str) -> Option<f64> {
        self.0.get(name).map(|f| f.value)
    }

    /// Number of features.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no features were measured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over `(name, feature)` in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Feature)> {
        self.0.iter()
    }

    /// All insufficient-data records, in feature-name order.
    pub fn insufficient(&self) -> impl Iterator<Item = &InsufficientData> {
        self.0.values().filter_map(|f| f.insufficient.as_ref())
    }
}

impl FromIterator<(String, Feature)> for FeatureSet {
    fn from_iter<I: IntoIterator<Item = (String, Feature)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A local intensity maximum.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Peak {
    /// Column.
    pub x: u32,
    /// Row.
    pub y: u32,
    /// Intensity at the peak.
    pub value: f32,
}

/// Dispersion statistics over a non-empty population.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Dispersion {
    /// Population size.
    pub count: usize,
    /// Arithmetic mean.
    pub mean: f64,
    /// Population standard deviation.
    pub std: f64,
    /// Smallest member.
    pub min: f64,
    /// Largest member.
    pub max: f64,
}

impl Dispersion {
    /// The requested statistic. `None` only for [`Statistic::Cv`] with
    /// a zero mean.
    #[must_use]
    pub fn get(&self, statistic: Statistic) -> Option<f64> {
        match statistic {
            Statistic::Mean => Some(self.mean),
            Statistic::Std => Some(self.std),
            Statistic::Min => Some(self.min),
            Statistic::Max => Some(self.max),
            Statistic::Cv => (self.mean.abs() > f64::EPSILON).then(|| self.std / self.mean),
        }
    }
}

/// Fraction of `values` strictly above `cutoff`. Empty input yields 0.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn density(values: &[f32], cutoff: f32) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let above = values.iter().filter(|&&v| v > cutoff).count();
    above as f64 / values.len() as f64
}

/// Per-pixel tissue mask: summed intensity across `channels` `> cutoff`.
///
/// The mask follows the first channel; pixels missing from a shorter
/// channel contribute nothing.
#[must_use]
pub fn tissue_mask(channels: &[StainChannel], cutoff: f32) -> Vec<bool> {
    let len = channels.first().map_or(0, |c| c.values().len());
    let mut sums = vec![0.0f32; len];
    for channel in channels {
        for (sum, &value) in sums.iter_mut().zip(channel.values()) {
            *sum += value;
        }
    }
    sums.into_iter().map(|sum| sum > cutoff).collect()
}

/// Find local maxima strictly above `min_intensity`.
///
/// A pixel is a peak when no pixel in its window is brighter and no
/// earlier pixel (raster order) in its window is equally bright, so a
/// flat plateau yields a single peak rather than one per pixel. Windows
/// are clipped at the image border.
#[must_use]
pub fn local_maxima(
    channel: &StainChannel,
    neighborhood: Neighborhood,
    min_intensity: f32,
) -> Vec<Peak> {
    let dims = channel.dimensions();
    let r = neighborhood.radius();
    let mut peaks = Vec::new();
    for y in 0..dims.height {
        for x in 0..dims.width {
            let value = channel.get(x, y);
            if value <= min_intensity {
                continue;
            }
            let is_peak = window(x, y, r, dims.width, dims.height).all(|(nx, ny)| {
                if (nx, ny) == (x, y) {
                    return true;
                }
                let other = channel.get(nx, ny);
                let earlier = (ny, nx) < (y, x);
                other < value || (other <= value && !earlier)
            });
            if is_peak {
                peaks.push(Peak { x, y, value });
            }
        }
    }
    peaks
}

/// Coordinates of the `(2r+1)^2` window around `(x, y)`, clipped.
fn window(x: u32, y: u32, r: u32, width: u32, height: u32) -> impl Iterator<Item = (u32, u32)> {
    let (x0, x1) = (x.saturating_sub(r), (x + r).min(width - 1));
    let (y0, y1) = (y.saturating_sub(r), (y + r).min(height - 1));
    (y0..=y1).flat_map(move |ny| (x0..=x1).map(move |nx| (nx, ny)))
}

/// Areas (pixel counts) of 8-connected regions with intensity `> cutoff`.
///
/// Uses [`imageproc::region_labelling::connected_components`] on the
/// thresholded mask. Regions are returned in label order.
#[must_use]
pub fn structure_areas(channel: &StainChannel, cutoff: f32) -> Vec<usize> {
    let dims = channel.dimensions();
    let mask = GrayImage::from_fn(dims.width, dims.height, |x, y| {
        Luma([if channel.get(x, y) > cutoff { 255 } else { 0 }])
    });
    let labels = connected_components(&mask, Connectivity::Eight, Luma([0u8]));
    let mut areas: Vec<usize> = Vec::new();
    for label in labels.pixels().map(|p| p.0[0] as usize) {
        if label == 0 {
            continue;
        }
        if areas.len() < label {
            areas.resize(label, 0);
        }
        areas[label - 1] += 1;
    }
    areas
}

/// Dispersion statistics of `values`, or `None` for an empty slice.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn dispersion(values: &[f64]) -> Option<Dispersion> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    Some(Dispersion {
        count: values.len(),
        mean,
        std: variance.sqrt(),
        min,
        max,
    })
}

/// `numerator / denominator`, or `None` when the denominator is below
/// [`RATIO_EPSILON`] in magnitude.
#[must_use]
pub fn ratio(numerator: f64, denominator: f64) -> Option<f64> {
    (denominator.abs() >= RATIO_EPSILON).then(|| numerator / denominator)
}

fn channel_statistic(stats: &ChannelStats, statistic: Statistic) -> Option<f64> {
    match statistic {
        Statistic::Mean => Some(stats.mean),
        Statistic::Std => Some(stats.std),
        Statistic::Min => Some(stats.min),
        Statistic::Max => Some(stats.max),
        Statistic::Cv => stats.cv(),
    }
}

/// Evaluates a fixed list of [`FeatureSpec`]s over stain channels.
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    specs: Vec<FeatureSpec>,
    min_population: usize,
}

impl FeatureExtractor {
    /// Build an extractor for channels named `channel_names`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Configuration`] for an empty or
    /// duplicate feature name, a reference to an unknown channel, a
    /// negative or non-finite cutoff, a non-positive `per_pixels`, or a
    /// zero `min_population`.
    pub fn new(
        specs: &[FeatureSpec],
        channel_names: &[String],
        min_population: usize,
    ) -> Result<Self, PipelineError> {
        if min_population == 0 {
            return Err(PipelineError::Configuration(
                "min_population must be at least 1".to_string(),
            ));
        }
        for (i, spec) in specs.iter().enumerate() {
            if spec.name.is_empty() {
                return Err(PipelineError::Configuration(
                    "feature names must not be empty".to_string(),
                ));
            }
            if specs[..i].iter().any(|s| s.name == spec.name) {
                return Err(PipelineError::Configuration(format!(
                    "duplicate feature `{}`",
                    spec.name
                )));
            }
            for channel in spec.kind.channels() {
                if !channel_names.iter().any(|c| c == channel) {
                    return Err(PipelineError::Configuration(format!(
                        "feature `{}` references unknown channel `{channel}`",
                        spec.name
                    )));
                }
            }
            if let Some(bad) = spec
                .kind
                .cutoffs()
                .into_iter()
                .find(|c| !(c.is_finite() && *c >= 0.0))
            {
                return Err(PipelineError::Configuration(format!(
                    "feature `{}` has invalid cutoff {bad}",
                    spec.name
                )));
            }
            if let FeatureKind::PeakDensity { per_pixels, .. } = spec.kind
                && !(per_pixels.is_finite() && per_pixels > 0.0)
            {
                return Err(PipelineError::Configuration(format!(
                    "feature `{}` needs a positive per_pixels, got {per_pixels}",
                    spec.name
                )));
            }
        }
        Ok(Self {
            specs: specs.to_vec(),
            min_population,
        })
    }

    /// The declared features, in configuration order.
    #[must_use]
    pub fn specs(&self) -> &[FeatureSpec] {
        &self.specs
    }

    /// Minimum population for dispersion statistics.
    #[must_use]
    pub const fn min_population(&self) -> usize {
        self.min_population
    }

    /// Measure every declared feature.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InputValidation`] if the channels do not
    /// share one size, or a referenced channel is missing from
    /// `channels` (the channel set does not match the one the extractor
    /// was built for).
    pub fn extract(&self, channels: &[StainChannel]) -> Result<FeatureSet, PipelineError> {
        if let Some(first) = channels.first()
            && let Some(other) = channels
                .iter()
                .find(|c| c.dimensions() != first.dimensions())
        {
            let (a, b) = (first.dimensions(), other.dimensions());
            return Err(PipelineError::InputValidation(format!(
                "channel `{}` is {}x{} but `{}` is {}x{}",
                other.name(),
                b.width,
                b.height,
                first.name(),
                a.width,
                a.height
            )));
        }
        self.specs
            .iter()
            .map(|spec| Ok((spec.name.clone(), self.measure(spec, channels)?)))
            .collect()
    }

    #[allow(clippy::cast_precision_loss)]
    fn measure(
        &self,
        spec: &FeatureSpec,
        channels: &[StainChannel],
    ) -> Result<Feature, PipelineError> {
        let name = spec.name.as_str();
        let feature = match &spec.kind {
            FeatureKind::Density { channel, cutoff } => {
                Feature::measured(density(find(channels, channel)?.values(), *cutoff))
            }
            FeatureKind::TissueFraction { cutoff } => {
                let mask = tissue_mask(channels, *cutoff);
                let tissue = mask.iter().filter(|&&t| t).count();
                if mask.is_empty() {
                    Feature::insufficient(name, 0, 1)
                } else {
                    Feature::measured(tissue as f64 / mask.len() as f64)
                }
            }
            FeatureKind::ChannelStat { channel, statistic } => {
                let channel = find(channels, channel)?;
                match channel_statistic(channel.stats(), *statistic) {
                    Some(value) => Feature::measured(value),
                    None => {
                        let signal = channel.values().iter().filter(|&&v| v > 0.0).count();
                        Feature::insufficient(name, signal, 1)
                    }
                }
            }
            FeatureKind::PeakCount {
                channel,
                neighborhood,
                min_intensity,
            } => {
                let peaks = local_maxima(find(channels, channel)?, *neighborhood, *min_intensity);
                Feature::measured(peaks.len() as f64)
            }
            FeatureKind::PeakDensity {
                channel,
                neighborhood,
                min_intensity,
                tissue_cutoff,
                per_pixels,
            } => {
                let peaks = local_maxima(find(channels, channel)?, *neighborhood, *min_intensity);
                let tissue = tissue_mask(channels, *tissue_cutoff)
                    .iter()
                    .filter(|&&t| t)
                    .count();
                if tissue == 0 {
                    Feature::insufficient(name, 0, 1)
                } else {
                    Feature::measured(peaks.len() as f64 / tissue as f64 * per_pixels)
                }
            }
            FeatureKind::PeakDispersion {
                channel,
                neighborhood,
                min_intensity,
                statistic,
            } => {
                let peaks = local_maxima(find(channels, channel)?, *neighborhood, *min_intensity);
                let values: Vec<f64> = peaks.iter().map(|p| f64::from(p.value)).collect();
                self.population_statistic(name, &values, *statistic)
            }
            FeatureKind::StructureArea {
                channel,
                cutoff,
                statistic,
            } => {
                let areas = structure_areas(find(channels, channel)?, *cutoff);
                let values: Vec<f64> = areas.iter().map(|&a| a as f64).collect();
                self.population_statistic(name, &values, *statistic)
            }
            FeatureKind::Ratio {
                numerator,
                denominator,
            } => {
                let num = find(channels, numerator)?;
                let den = find(channels, denominator)?;
                match ratio(num.stats().mean, den.stats().mean) {
                    Some(value) => Feature::measured(value),
                    None => {
                        let signal = den.values().iter().filter(|&&v| v > 0.0).count();
                        Feature::insufficient(name, signal, 1)
                    }
                }
            }
        };
        Ok(feature)
    }

    fn population_statistic(&self, name: &str, values: &[f64], statistic: Statistic) -> Feature {
        if values.len() < self.min_population {
            return Feature::insufficient(name, values.len(), self.min_population);
        }
        match dispersion(values).and_then(|d| d.get(statistic)) {
            Some(value) => Feature::measured(value),
            None => Feature::insufficient(name, values.len(), self.min_population),
        }
    }
}

fn find<'a>(channels: &'a [StainChannel], name: &str) -> Result<&'a StainChannel, PipelineError> {
    channels.iter().find(|c| c.name() == name).ok_or_else(|| {
        PipelineError::InputValidation(format!("channel `{name}` is missing"))
    })
}
