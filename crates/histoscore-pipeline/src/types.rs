//! Shared types for the histoscore pipeline.

use serde::{Deserialize, Serialize};

/// Re-export `GrayImage` so downstream crates can reference
/// quantized channel rasters without depending on `image` directly.
pub use image::GrayImage;

/// Re-export `RgbaImage` so loaders can hand decoded images to
/// [`RawImage::from_rgba_image`] without depending on `image` directly.
pub use image::RgbaImage;

/// Bytes per RGBA pixel.
pub const RGBA_CHANNELS: usize = 4;

/// Image dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Dimensions {
    /// Total number of pixels (`width * height`).
    #[must_use]
    pub const fn pixel_count(self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Row-major index of `(x, y)`.
    #[must_use]
    pub const fn index(self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }
}

/// An RGBA image handed to the pipeline by an external loader.
///
/// The buffer length is guaranteed to equal `width * height * 4` and
/// both dimensions are non-zero; every constructor checks this so the
/// stages downstream never see a malformed image. Alpha is carried
/// but never read by the unmixer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawImageProxy", into = "RawImageProxy")]
pub struct RawImage {
    dimensions: Dimensions,
    pixels: Vec<u8>,
}

impl RawImage {
    /// Wrap an RGBA byte buffer.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InputValidation`] if either dimension is
    /// zero, the buffer is empty, or its length is not
    /// `width * height * 4`.
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self, PipelineError> {
        if pixels.is_empty() {
            return Err(PipelineError::InputValidation(
                "pixel buffer is empty".to_string(),
            ));
        }
        if width == 0 || height == 0 {
            return Err(PipelineError::InputValidation(format!(
                "image dimensions must be positive, got {width}x{height}"
            )));
        }
        let dimensions = Dimensions { width, height };
        let expected = dimensions
            .pixel_count()
            .checked_mul(RGBA_CHANNELS)
            .ok_or_else(|| {
                PipelineError::InputValidation(format!("image {width}x{height} is too large"))
            })?;
        if pixels.len() != expected {
            return Err(PipelineError::InputValidation(format!(
                "pixel buffer has {} bytes, expected {expected} for {width}x{height} RGBA",
                pixels.len()
            )));
        }
        Ok(Self { dimensions, pixels })
    }

    /// Take ownership of a decoded [`RgbaImage`].
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InputValidation`] for a zero-sized image.
    pub fn from_rgba_image(image: RgbaImage) -> Result<Self, PipelineError> {
        let (width, height) = image.dimensions();
        Self::new(width, height, image.into_raw())
    }

    /// Decode encoded image bytes (PNG, JPEG, BMP, TIFF, WebP) into RGBA.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InputValidation`] if `bytes` is empty or
    /// the format is unrecognized or corrupt.
    pub fn decode(bytes: &[u8]) -> Result<Self, PipelineError> {
        if bytes.is_empty() {
            return Err(PipelineError::InputValidation(
                "image data is empty".to_string(),
            ));
        }
        let image = image::load_from_memory(bytes)
            .map_err(|e| PipelineError::InputValidation(format!("cannot decode image: {e}")))?;
        Self::from_rgba_image(image.to_rgba8())
    }

    /// A `width x height` image filled with one RGBA colour.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InputValidation`] if either dimension is zero.
    pub fn uniform(width: u32, height: u32, rgba: [u8; 4]) -> Result<Self, PipelineError> {
        let count = width as usize * height as usize;
        let pixels = rgba.repeat(count);
        Self::new(width, height, pixels)
    }

    /// Image dimensions.
    #[must_use]
    pub const fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    /// Width in pixels.
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.dimensions.width
    }

    /// Height in pixels.
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.dimensions.height
    }

    /// The raw RGBA bytes, row-major.
    #[must_use]
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Iterate over the RGB triples, dropping alpha.
    pub fn rgb(&self) -> impl Iterator<Item = [u8; 3]> + '_ {
        self.pixels
            .chunks_exact(RGBA_CHANNELS)
            .map(|px| [px[0], px[1], px[2]])
    }
}

/// Serde proxy for [`RawImage`] so deserialized images pass through
/// the same validation as [`RawImage::new`].
#[derive(Serialize, Deserialize)]
struct RawImageProxy {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl TryFrom<RawImageProxy> for RawImage {
    type Error = PipelineError;

    fn try_from(proxy: RawImageProxy) -> Result<Self, Self::Error> {
        Self::new(proxy.width, proxy.height, proxy.pixels)
    }
}

impl From<RawImage> for RawImageProxy {
    fn from(image: RawImage) -> Self {
        Self {
            width: image.dimensions.width,
            height: image.dimensions.height,
            pixels: image.pixels,
        }
    }
}

/// Summary statistics of one stain channel.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ChannelStats {
    /// Arithmetic mean intensity.
    pub mean: f64,
    /// Population standard deviation.
    pub std: f64,
    /// Smallest intensity.
    pub min: f64,
    /// Largest intensity.
    pub max: f64,
}

impl ChannelStats {
    /// Compute stats over `values`. An empty slice yields all zeros.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_values(values: &[f32]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let n = values.len() as f64;
        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for &v in values {
            let v = f64::from(v);
            sum += v;
            min = min.min(v);
            max = max.max(v);
        }
        let mean = sum / n;
        let variance = values
            .iter()
            .map(|&v| {
                let d = f64::from(v) - mean;
                d * d
            })
            .sum::<f64>()
            / n;
        Self {
            mean,
            std: variance.sqrt(),
            min,
            max,
        }
    }

    /// Coefficient of variation (`std / mean`), or `None` when the mean
    /// is too close to zero for the ratio to mean anything.
    #[must_use]
    pub fn cv(&self) -> Option<f64> {
        (self.mean.abs() > f64::EPSILON).then(|| self.std / self.mean)
    }
}

/// One named intensity channel recovered by stain unmixing.
///
/// Intensities are optical-density units clamped to the unmixer's
/// valid range. Stats are kept in sync with the values: every
/// constructor recomputes them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StainChannel {
    name: String,
    dimensions: Dimensions,
    values: Vec<f32>,
    stats: ChannelStats,
}

impl StainChannel {
    /// Build a channel, computing its stats.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InputValidation`] if `values.len()` does
    /// not match `dimensions`.
    pub fn new(
        name: impl Into<String>,
        dimensions: Dimensions,
        values: Vec<f32>,
    ) -> Result<Self, PipelineError> {
        let name = name.into();
        if values.len() != dimensions.pixel_count() {
            return Err(PipelineError::InputValidation(format!(
                "channel `{name}` has {} values, expected {}",
                values.len(),
                dimensions.pixel_count()
            )));
        }
        let stats = ChannelStats::from_values(&values);
        Ok(Self {
            name,
            dimensions,
            values,
            stats,
        })
    }

    /// Replace the intensities, keeping the name and dimensions.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InputValidation`] on a length change.
    pub fn with_values(self, values: Vec<f32>) -> Result<Self, PipelineError> {
        Self::new(self.name, self.dimensions, values)
    }

    /// Channel name (the reference stain it was projected onto).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Channel dimensions.
    #[must_use]
    pub const fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    /// Row-major intensities.
    #[must_use]
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Summary statistics.
    #[must_use]
    pub const fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    /// Intensity at `(x, y)`.
    #[must_use]
    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.values[self.dimensions.index(x, y)]
    }

    /// Quantize onto an 8-bit raster covering `[0, max_intensity]`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn to_gray(&self, max_intensity: f32) -> GrayImage {
        let scale = if max_intensity > 0.0 {
            255.0 / max_intensity
        } else {
            0.0
        };
        let raw = self
            .values
            .iter()
            .map(|&v| (v * scale).round().clamp(0.0, 255.0) as u8)
            .collect();
        GrayImage::from_raw(self.dimensions.width, self.dimensions.height, raw)
            .unwrap_or_else(|| GrayImage::new(self.dimensions.width, self.dimensions.height))
    }
}

/// Errors that abort an analysis or pipeline construction.
///
/// Insufficient data is deliberately not a variant: it degrades
/// confidence instead of aborting (see [`InsufficientData`]).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    /// The input image is malformed.
    #[error("invalid input image: {0}")]
    InputValidation(String),

    /// The pipeline configuration violates a construction-time invariant.
    #[error("invalid pipeline configuration: {0}")]
    Configuration(String),
}

/// A measurement whose population was too small to be meaningful.
///
/// Non-fatal. The feature carries the sentinel value, the criteria that
/// read it score zero with degraded confidence, and the record ends up
/// in the category breakdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("insufficient data for `{feature}`: population {population}, need at least {required}")]
pub struct InsufficientData {
    /// Feature that could not be measured.
    pub feature: String,
    /// Members actually found.
    pub population: usize,
    /// Minimum members required.
    pub required: usize,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // --- RawImage tests ---

    #[test]
    fn raw_image_rejects_empty_buffer() {
        let result = RawImage::new(4, 4, Vec::new());
        assert!(matches!(result, Err(PipelineError::InputValidation(_))));
    }

    #[test]
    fn raw_image_rejects_zero_dimensions() {
        assert!(matches!(
            RawImage::new(0, 4, vec![0; 16]),
            Err(PipelineError::InputValidation(_))
        ));
        assert!(matches!(
            RawImage::new(4, 0, vec![0; 16]),
            Err(PipelineError::InputValidation(_))
        ));
    }

    #[test]
    fn raw_image_rejects_length_mismatch() {
        let result = RawImage::new(2, 2, vec![0; 15]);
        assert!(matches!(result, Err(PipelineError::InputValidation(_))));
    }

    #[test]
    fn raw_image_rgb_drops_alpha() {
        let img = RawImage::new(2, 1, vec![1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        let rgb: Vec<[u8; 3]> = img.rgb().collect();
        assert_eq!(rgb, vec![[1, 2, 3], [5, 6, 7]]);
    }

    #[test]
    fn raw_image_from_rgba_image_keeps_dimensions() {
        let img = RgbaImage::from_pixel(3, 5, image::Rgba([9, 8, 7, 6]));
        let raw = RawImage::from_rgba_image(img).unwrap();
        assert_eq!(
            raw.dimensions(),
            Dimensions {
                width: 3,
                height: 5
            }
        );
        assert_eq!(raw.pixels().len(), 60);
    }

    #[test]
    fn raw_image_deserialize_validates() {
        let json = r#"{"width":2,"height":2,"pixels":[0,0,0]}"#;
        let result: Result<RawImage, _> = serde_json::from_str(json);
        assert!(result.is_err());

        let img = RawImage::uniform(1, 1, [10, 20, 30, 40]).unwrap();
        let json = serde_json::to_string(&img).unwrap();
        let back: RawImage = serde_json::from_str(&json).unwrap();
        assert_eq!(img, back);
    }

    // --- ChannelStats tests ---

    #[test]
    fn stats_of_empty_slice_are_zero() {
        assert_eq!(ChannelStats::from_values(&[]), ChannelStats::default());
    }

    #[test]
    fn stats_of_known_values() {
        let stats = ChannelStats::from_values(&[1.0, 2.0, 3.0, 4.0]);
        assert!((stats.mean - 2.5).abs() < 1e-12);
        assert!((stats.std - 1.25_f64.sqrt()).abs() < 1e-12);
        assert!((stats.min - 1.0).abs() < f64::EPSILON);
        assert!((stats.max - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn cv_is_none_for_zero_mean() {
        let stats = ChannelStats::from_values(&[0.0, 0.0]);
        assert!(stats.cv().is_none());
    }

    // --- StainChannel tests ---

    #[test]
    fn channel_rejects_wrong_length() {
        let dims = Dimensions {
            width: 2,
            height: 2,
        };
        assert!(StainChannel::new("primary", dims, vec![0.0; 3]).is_err());
    }

    #[test]
    fn channel_to_gray_quantizes_range() {
        let dims = Dimensions {
            width: 3,
            height: 1,
        };
        let channel = StainChannel::new("primary", dims, vec![0.0, 1.5, 3.0]).unwrap();
        let gray = channel.to_gray(3.0);
        assert_eq!(gray.as_raw(), &vec![0, 128, 255]);
    }

    // --- Error tests ---

    #[test]
    fn error_display() {
        let err = PipelineError::Configuration("weights sum to 0.9".to_string());
        assert_eq!(
            err.to_string(),
            "invalid pipeline configuration: weights sum to 0.9"
        );
        let insufficient = InsufficientData {
            feature: "area_cv".to_string(),
            population: 0,
            required: 3,
        };
        assert_eq!(
            insufficient.to_string(),
            "insufficient data for `area_cv`: population 0, need at least 3"
        );
    }
}
