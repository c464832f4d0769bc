//! Stain unmixing (colour deconvolution) in optical-density space.
//!
//! Each pixel's RGB is converted to optical density
//! `OD = -log10(max(c / 255, epsilon))` and projected onto the inverse
//! of the reference stain matrix, giving one intensity per stain.
//! Stain absorption is approximately linear in OD (Beer-Lambert), which
//! is why the projection happens there and not on raw RGB.
//!
//! Near-white background pixels have near-zero OD in every channel.
//! Later stages rely on that for tissue/background discrimination.
//!
//! This is the first stage of the pipeline: [`RawImage`] in,
//! [`StainChannel`]s out.

use serde::{Deserialize, Serialize};

use crate::types::{PipelineError, RawImage, StainChannel};

/// Smallest absolute determinant accepted for the stain matrix.
const MIN_DETERMINANT: f64 = 1e-6;

/// A named reference stain: its RGB optical-density absorption vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StainVector {
    /// Channel name produced for this stain.
    pub name: String,
    /// OD absorption in R, G, B. Normalized to unit length at construction.
    pub od: [f64; 3],
}

impl StainVector {
    /// Create a stain vector.
    #[must_use]
    pub fn new(name: impl Into<String>, od: [f64; 3]) -> Self {
        Self {
            name: name.into(),
            od,
        }
    }
}

/// Configuration for [`StainUnmixer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnmixingConfig {
    /// Two or three reference stains. With two, a third residual stain
    /// orthogonal to both is derived.
    pub stains: Vec<StainVector>,
    /// Name of the derived residual channel (only used with two stains).
    pub residual_name: String,
    /// Floor applied to normalized intensities before the logarithm.
    pub epsilon: f64,
    /// Upper bound of every channel; intensities are clamped to
    /// `[0, max_intensity]`.
    pub max_intensity: f32,
}

impl UnmixingConfig {
    /// Ruifrok-Johnston hematoxylin absorption vector.
    pub const HEMATOXYLIN_OD: [f64; 3] = [0.644_211, 0.716_556, 0.266_844];
    /// Ruifrok-Johnston eosin absorption vector.
    pub const EOSIN_OD: [f64; 3] = [0.092_789, 0.954_111, 0.283_111];
    /// Default OD floor: one 8-bit quantization step.
    pub const DEFAULT_EPSILON: f64 = 1.0 / 255.0;
    /// Default channel ceiling in OD units.
    pub const DEFAULT_MAX_INTENSITY: f32 = 3.0;
}

impl Default for UnmixingConfig {
    fn default() -> Self {
        Self {
            stains: vec![
                StainVector::new("primary", Self::HEMATOXYLIN_OD),
                StainVector::new("secondary", Self::EOSIN_OD),
            ],
            residual_name: "residual".to_string(),
            epsilon: Self::DEFAULT_EPSILON,
            max_intensity: Self::DEFAULT_MAX_INTENSITY,
        }
    }
}

/// Separates an RGBA image into stain intensity channels.
///
/// The unmixing matrix is derived once from the configured stain
/// vectors and never changes afterwards.
#[derive(Debug, Clone)]
pub struct StainUnmixer {
    names: Vec<String>,
    /// `unmixing[k][j]`: contribution of OD channel `k` (R, G, B) to stain `j`.
    unmixing: [[f64; 3]; 3],
    /// OD for every 8-bit intensity, indexed by the byte value.
    od_table: [f64; 256],
    max_intensity: f32,
}

impl StainUnmixer {
    /// Build an unmixer from its configuration.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Configuration`] if fewer than two or more
    /// than three stains are given, names are empty or repeated, a
    /// vector is zero or non-finite, the stain matrix is singular, or
    /// `epsilon`/`max_intensity` is out of range.
    pub fn new(config: &UnmixingConfig) -> Result<Self, PipelineError> {
        if !(config.epsilon > 0.0 && config.epsilon < 1.0) {
            return Err(PipelineError::Configuration(format!(
                "unmixing epsilon must be in (0, 1), got {}",
                config.epsilon
            )));
        }
        if !(config.max_intensity.is_finite() && config.max_intensity > 0.0) {
            return Err(PipelineError::Configuration(format!(
                "max_intensity must be positive, got {}",
                config.max_intensity
            )));
        }

        let mut names: Vec<String> = Vec::with_capacity(3);
        let mut rows: Vec<[f64; 3]> = Vec::with_capacity(3);
        match config.stains.len() {
            2 | 3 => {}
            n => {
                return Err(PipelineError::Configuration(format!(
                    "expected 2 or 3 reference stains, got {n}"
                )));
            }
        }
        for stain in &config.stains {
            let od = normalize(stain.od).ok_or_else(|| {
                PipelineError::Configuration(format!(
                    "stain `{}` has a zero or non-finite OD vector",
                    stain.name
                ))
            })?;
            names.push(stain.name.clone());
            rows.push(od);
        }
        if rows.len() == 2 {
            let residual = normalize(cross(rows[0], rows[1])).ok_or_else(|| {
                PipelineError::Configuration(
                    "stain vectors are parallel; cannot derive a residual stain".to_string(),
                )
            })?;
            names.push(config.residual_name.clone());
            rows.push(residual);
        }
        check_names(&names)?;

        let stain_matrix = [rows[0], rows[1], rows[2]];
        let unmixing = invert(stain_matrix).ok_or_else(|| {
            PipelineError::Configuration("stain matrix is singular".to_string())
        })?;

        let od_table = std::array::from_fn(|v| {
            optical_density(u8::try_from(v).unwrap_or(u8::MAX), config.epsilon)
        });

        Ok(Self {
            names,
            unmixing,
            od_table,
            max_intensity: config.max_intensity,
        })
    }

    /// Names of the channels [`unmix`](Self::unmix) produces, in order.
    #[must_use]
    pub fn channel_names(&self) -> &[String] {
        &self.names
    }

    /// The derived unmixing matrix (`[od_channel][stain]`).
    #[must_use]
    pub const fn matrix(&self) -> &[[f64; 3]; 3] {
        &self.unmixing
    }

    /// Upper bound of every produced channel.
    #[must_use]
    pub const fn max_intensity(&self) -> f32 {
        self.max_intensity
    }

    /// Project a single RGB pixel onto the stains, clamped to the valid range.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn unmix_pixel(&self, rgb: [u8; 3]) -> [f32; 3] {
        let od = rgb.map(|c| self.od_table[usize::from(c)]);
        std::array::from_fn(|j| {
            let intensity = od[0].mul_add(
                self.unmixing[0][j],
                od[1].mul_add(self.unmixing[1][j], od[2] * self.unmixing[2][j]),
            );
            (intensity as f32).clamp(0.0, self.max_intensity)
        })
    }

    /// Separate `image` into one channel per stain.
    ///
    /// # Errors
    ///
    /// Propagates [`PipelineError::InputValidation`] from channel
    /// construction; a validated [`RawImage`] never triggers it.
    pub fn unmix(&self, image: &RawImage) -> Result<Vec<StainChannel>, PipelineError> {
        let count = image.dimensions().pixel_count();
        let mut planes: [Vec<f32>; 3] = std::array::from_fn(|_| Vec::with_capacity(count));
        for rgb in image.rgb() {
            let stains = self.unmix_pixel(rgb);
            for (plane, value) in planes.iter_mut().zip(stains) {
                plane.push(value);
            }
        }
        self.names
            .iter()
            .zip(planes)
            .map(|(name, values)| StainChannel::new(name.clone(), image.dimensions(), values))
            .collect()
    }
}

/// Optical density of one 8-bit channel value.
///
/// `-log10(max(value / 255, epsilon))`. White (255) maps to exactly zero.
#[must_use]
pub fn optical_density(value: u8, epsilon: f64) -> f64 {
    let normalized = (f64::from(value) / 255.0).max(epsilon);
    // `-log10(1.0)` is `-0.0`; add zero to normalize the sign.
    -normalized.log10() + 0.0
}

fn check_names(names: &[String]) -> Result<(), PipelineError> {
    for (i, name) in names.iter().enumerate() {
        if name.is_empty() {
            return Err(PipelineError::Configuration(
                "stain names must not be empty".to_string(),
            ));
        }
        if names[..i].contains(name) {
            return Err(PipelineError::Configuration(format!(
                "duplicate stain name `{name}`"
            )));
        }
    }
    Ok(())
}

fn normalize(v: [f64; 3]) -> Option<[f64; 3]> {
    let norm = v.iter().map(|x| x * x).sum::<f64>().sqrt();
    (norm.is_finite() && norm > f64::EPSILON).then(|| v.map(|x| x / norm))
}

fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1].mul_add(b[2], -(a[2] * b[1])),
        a[2].mul_add(b[0], -(a[0] * b[2])),
        a[0].mul_add(b[1], -(a[1] * b[0])),
    ]
}

/// Inverse of a 3x3 matrix by cofactors, or `None` when near-singular.
fn invert(m: [[f64; 3]; 3]) -> Option<[[f64; 3]; 3]> {
    let [[a, b, c], [d, e, f], [g, h, i]] = m;
    let co_a = e.mul_add(i, -(f * h));
    let co_b = f.mul_add(g, -(d * i));
    let co_c = d.mul_add(h, -(e * g));
    let det = a.mul_add(co_a, b.mul_add(co_b, c * co_c));
    if !det.is_finite() || det.abs() < MIN_DETERMINANT {
        return None;
    }
    Some([
        [
            co_a / det,
            c.mul_add(h, -(b * i)) / det,
            b.mul_add(f, -(c * e)) / det,
        ],
        [
            co_b / det,
            a.mul_add(i, -(c * g)) / det,
            c.mul_add(d, -(a * f)) / det,
        ],
        [
            co_c / det,
            b.mul_add(g, -(a * h)) / det,
            a.mul_add(e, -(b * d)) / det,
        ],
    ])
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn default_unmixer() -> StainUnmixer {
        StainUnmixer::new(&UnmixingConfig::default()).unwrap()
    }

    #[test]
    fn white_has_zero_optical_density() {
        let od = optical_density(255, UnmixingConfig::DEFAULT_EPSILON);
        assert!(od.abs() < f64::EPSILON);
        assert!(od.is_sign_positive());
    }

    #[test]
    fn black_is_floored_by_epsilon() {
        let od = optical_density(0, 0.01);
        assert!((od - 2.0).abs() < 1e-12);
    }

    #[test]
    fn default_has_three_named_channels() {
        let unmixer = default_unmixer();
        assert_eq!(
            unmixer.channel_names(),
            &["primary".to_string(), "secondary".to_string(), "residual".to_string()]
        );
    }

    #[test]
    fn matrix_inverts_the_stain_matrix() {
        // Unmixing a pure reference stain's OD must recover that stain alone.
        let unmixer = default_unmixer();
        let h = normalize(UnmixingConfig::HEMATOXYLIN_OD).unwrap();
        let m = unmixer.matrix();
        for j in 0..3 {
            let value: f64 = (0..3).map(|k| h[k] * m[k][j]).sum();
            let expected = if j == 0 { 1.0 } else { 0.0 };
            assert!(
                (value - expected).abs() < 1e-9,
                "stain {j}: expected {expected}, got {value}"
            );
        }
    }

    #[test]
    fn white_pixel_unmixes_to_zero() {
        let unmixer = default_unmixer();
        assert_eq!(unmixer.unmix_pixel([255, 255, 255]), [0.0, 0.0, 0.0]);
    }

    #[test]
    fn intensities_are_clamped() {
        let unmixer = default_unmixer();
        for rgb in [[0, 0, 0], [255, 0, 0], [0, 255, 0], [0, 0, 255], [10, 200, 30]] {
            for v in unmixer.unmix_pixel(rgb) {
                assert!((0.0..=unmixer.max_intensity()).contains(&v), "{rgb:?} -> {v}");
            }
        }
    }

    #[test]
    fn hematoxylin_like_pixel_is_primary_dominant() {
        let unmixer = default_unmixer();
        let [primary, secondary, _] = unmixer.unmix_pixel([60, 30, 120]);
        assert!(primary > 3.0 * secondary, "primary={primary} secondary={secondary}");
    }

    #[test]
    fn eosin_like_pixel_is_secondary_dominant() {
        let unmixer = default_unmixer();
        let [primary, secondary, _] = unmixer.unmix_pixel([230, 120, 200]);
        assert!(secondary > 5.0 * primary, "primary={primary} secondary={secondary}");
    }

    #[test]
    fn unmix_produces_one_channel_per_stain() {
        let unmixer = default_unmixer();
        let img = RawImage::uniform(5, 3, [200, 150, 230, 255]).unwrap();
        let channels = unmixer.unmix(&img).unwrap();
        assert_eq!(channels.len(), 3);
        for channel in &channels {
            assert_eq!(channel.values().len(), 15);
        }
    }

    #[test]
    fn three_explicit_stains_are_accepted() {
        let config = UnmixingConfig {
            stains: vec![
                StainVector::new("h", [0.65, 0.70, 0.29]),
                StainVector::new("e", [0.07, 0.99, 0.11]),
                StainVector::new("dab", [0.27, 0.57, 0.78]),
            ],
            ..UnmixingConfig::default()
        };
        let unmixer = StainUnmixer::new(&config).unwrap();
        assert_eq!(unmixer.channel_names().len(), 3);
        assert_eq!(unmixer.channel_names()[2], "dab");
    }

    #[test]
    fn rejects_wrong_stain_count() {
        let config = UnmixingConfig {
            stains: vec![StainVector::new("only", [1.0, 0.0, 0.0])],
            ..UnmixingConfig::default()
        };
        assert!(matches!(
            StainUnmixer::new(&config),
            Err(PipelineError::Configuration(_))
        ));
    }

    #[test]
    fn rejects_parallel_stains() {
        let config = UnmixingConfig {
            stains: vec![
                StainVector::new("a", [1.0, 1.0, 0.0]),
                StainVector::new("b", [2.0, 2.0, 0.0]),
            ],
            ..UnmixingConfig::default()
        };
        assert!(matches!(
            StainUnmixer::new(&config),
            Err(PipelineError::Configuration(_))
        ));
    }

    #[test]
    fn rejects_singular_three_stain_matrix() {
        let config = UnmixingConfig {
            stains: vec![
                StainVector::new("a", [1.0, 0.0, 0.0]),
                StainVector::new("b", [0.0, 1.0, 0.0]),
                StainVector::new("c", [1.0, 1.0, 0.0]),
            ],
            ..UnmixingConfig::default()
        };
        assert!(matches!(
            StainUnmixer::new(&config),
            Err(PipelineError::Configuration(_))
        ));
    }

    #[test]
    fn rejects_duplicate_names() {
        let config = UnmixingConfig {
            residual_name: "primary".to_string(),
            ..UnmixingConfig::default()
        };
        assert!(matches!(
            StainUnmixer::new(&config),
            Err(PipelineError::Configuration(_))
        ));
    }

    #[test]
    fn rejects_bad_epsilon() {
        for epsilon in [0.0, -1.0, 1.0, f64::NAN] {
            let config = UnmixingConfig {
                epsilon,
                ..UnmixingConfig::default()
            };
            assert!(StainUnmixer::new(&config).is_err(), "epsilon={epsilon}");
        }
    }
}
