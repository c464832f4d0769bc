//! Per-channel denoising and contrast normalization.
//!
//! Each stain channel is smoothed with a small neighborhood filter and
//! then contrast-stretched from its histogram percentiles towards the
//! full `[0, max_intensity]` range. The stretch gain is capped, so a
//! faintly tinted slide stays faint and absolute intensity cutoffs keep
//! separating stained structures from background. Channels are
//! processed independently.
//!
//! Smoothing wraps [`imageproc::filter::median_filter`] and
//! [`imageproc::filter::box_filter`], which operate on 8-bit rasters,
//! so the channel is quantized onto 256 levels over
//! `[0, max_intensity]` first. One level is `max_intensity / 255` OD
//! units (about 0.012 with the default ceiling).
//!
//! Applying the processor twice is safe but does not converge to a
//! fixed point in general.

use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::types::{PipelineError, StainChannel};

/// Neighborhood smoothing filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SmoothingFilter {
    /// No smoothing; values are left at full precision.
    None,
    /// Mean over the neighborhood.
    Mean,
    /// Median over the neighborhood. Removes isolated spikes without
    /// blurring structure borders.
    #[default]
    Median,
}

/// Configuration for [`ChannelPostProcessor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostProcessConfig {
    /// Smoothing filter.
    pub smoothing: SmoothingFilter,
    /// Neighborhood radius: 1 is a 3x3 window, 2 is 5x5.
    pub radius: u32,
    /// Whether to apply the histogram contrast stretch.
    pub stretch: bool,
    /// Lower histogram percentile mapped to zero, in `[0, 1)`.
    pub low_percentile: f64,
    /// Upper histogram percentile mapped to `max_intensity`, in `(0, 1]`.
    pub high_percentile: f64,
    /// Channels whose percentile span is below this are not stretched,
    /// so uniform images and blank backgrounds are not amplified.
    pub min_span: f32,
    /// Largest factor the stretch may multiply intensities by.
    pub max_gain: f32,
}

impl Default for PostProcessConfig {
    fn default() -> Self {
        Self {
            smoothing: SmoothingFilter::default(),
            radius: 1,
            stretch: true,
            low_percentile: 0.01,
            high_percentile: 0.99,
            min_span: 0.05,
            max_gain: 2.0,
        }
    }
}

/// Denoises and contrast-normalizes stain channels.
#[derive(Debug, Clone)]
pub struct ChannelPostProcessor {
    config: PostProcessConfig,
    max_intensity: f32,
}

impl ChannelPostProcessor {
    /// Build a post-processor for channels bounded by `max_intensity`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Configuration`] if the radius is not 1
    /// or 2 while smoothing is enabled, the percentiles are not ordered
    /// inside `[0, 1]`, or `min_span` or `max_gain` is out of range.
    pub fn new(config: &PostProcessConfig, max_intensity: f32) -> Result<Self, PipelineError> {
        if config.smoothing != SmoothingFilter::None && !(1..=2).contains(&config.radius) {
            return Err(PipelineError::Configuration(format!(
                "smoothing radius must be 1 (3x3) or 2 (5x5), got {}",
                config.radius
            )));
        }
        let (lo, hi) = (config.low_percentile, config.high_percentile);
        if !(0.0..1.0).contains(&lo) || !(0.0..=1.0).contains(&hi) || lo >= hi {
            return Err(PipelineError::Configuration(format!(
                "stretch percentiles must satisfy 0 <= low < high <= 1, got {lo} and {hi}"
            )));
        }
        if !(config.min_span.is_finite() && config.min_span >= 0.0) {
            return Err(PipelineError::Configuration(format!(
                "min_span must be non-negative, got {}",
                config.min_span
            )));
        }
        if !(config.max_gain.is_finite() && config.max_gain > 0.0) {
            return Err(PipelineError::Configuration(format!(
                "max_gain must be positive, got {}",
                config.max_gain
            )));
        }
        Ok(Self {
            config: config.clone(),
            max_intensity,
        })
    }

    /// Smooth and stretch one channel. The channel length never changes.
    ///
    /// # Errors
    ///
    /// Propagates [`PipelineError::InputValidation`] from channel
    /// reconstruction; it cannot fire for a well-formed channel.
    pub fn process(&self, channel: StainChannel) -> Result<StainChannel, PipelineError> {
        let (smoothed, gray) = self.smooth(&channel);
        let values = if self.config.stretch {
            contrast_stretch(
                &smoothed,
                &gray,
                self.config.low_percentile,
                self.config.high_percentile,
                self.config.min_span,
                self.config.max_gain,
                self.max_intensity,
            )
        } else {
            smoothed
        };
        channel.with_values(values)
    }

    /// Apply the neighborhood filter, returning the smoothed values and
    /// their 8-bit raster (used for the histogram).
    fn smooth(&self, channel: &StainChannel) -> (Vec<f32>, GrayImage) {
        let gray = channel.to_gray(self.max_intensity);
        let r = self.config.radius;
        let filtered = match self.config.smoothing {
            SmoothingFilter::None => return (channel.values().to_vec(), gray),
            SmoothingFilter::Mean => imageproc::filter::box_filter(&gray, r, r),
            SmoothingFilter::Median => imageproc::filter::median_filter(&gray, r, r),
        };
        let step = self.max_intensity / 255.0;
        let values = filtered
            .as_raw()
            .iter()
            .map(|&b| f32::from(b) * step)
            .collect();
        (values, filtered)
    }
}

/// Map the `[low, high]` percentile band of `values` onto
/// `[0, max_intensity]`, multiplying by at most `max_gain`.
///
/// Percentiles are read from the 256-bin histogram of `gray` (the
/// quantized form of `values`). When the band is narrower than
/// `min_span` the values are returned unchanged.
#[must_use]
pub fn contrast_stretch(
    values: &[f32],
    gray: &GrayImage,
    low: f64,
    high: f64,
    min_span: f32,
    max_gain: f32,
    max_intensity: f32,
) -> Vec<f32> {
    let histogram = imageproc::stats::histogram(gray);
    let Some(bins) = histogram.channels.first() else {
        return values.to_vec();
    };
    let step = max_intensity / 255.0;
    let lo = f32::from(percentile_bin(bins, low)) * step;
    let hi = f32::from(percentile_bin(bins, high)) * step;
    let span = hi - lo;
    if span < min_span || span <= 0.0 {
        return values.to_vec();
    }
    let gain = (max_intensity / span).min(max_gain);
    values
        .iter()
        .map(|&v| ((v - lo) * gain).clamp(0.0, max_intensity))
        .collect()
}

/// Smallest bin whose cumulative count reaches `fraction` of the total.
#[allow(clippy::cast_precision_loss)]
fn percentile_bin(bins: &[u32; 256], fraction: f64) -> u8 {
    let total: u64 = bins.iter().map(|&c| u64::from(c)).sum();
    let target = (total as f64 * fraction).max(1.0);
    let mut cumulative = 0u64;
    for (bin, &count) in (0u8..=255).zip(bins.iter()) {
        cumulative += u64::from(count);
        if cumulative as f64 >= target {
            return bin;
        }
    }
    u8::MAX
}
