//! Threshold classification of the final score.
//!
//! Bands are listed highest first. A score falls in the first band
//! whose cutoff it strictly exceeds; a score equal to a cutoff belongs
//! to the band below. Scores that exceed no cutoff get the fallback
//! label. Ranks count from 0 for the highest band, so a higher score
//! never receives a higher rank.

use serde::{Deserialize, Serialize};

use crate::types::PipelineError;

/// One labeled band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Band {
    /// Label assigned to scores in this band.
    pub label: String,
    /// Scores strictly greater than this fall in the band.
    pub above: f64,
}

impl Band {
    /// A band labeled `label` for scores above `above`.
    #[must_use]
    pub fn new(label: impl Into<String>, above: f64) -> Self {
        Self {
            label: label.into(),
            above,
        }
    }
}

/// Ordered bands plus a fallback label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Bands in strictly decreasing `above` order.
    pub bands: Vec<Band>,
    /// Label for scores exceeding no cutoff.
    pub fallback: String,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            bands: vec![
                Band::new("high", 0.85),
                Band::new("moderate", 0.65),
                Band::new("low", 0.45),
            ],
            fallback: "minimal".to_string(),
        }
    }
}

/// A label and its rank (0 is the highest band).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    /// Band label.
    pub label: String,
    /// Position of the band; the fallback ranks last.
    pub rank: usize,
}

/// Maps a final score to a label.
#[derive(Debug, Clone)]
pub struct Classifier {
    config: ClassifierConfig,
}

impl Classifier {
    /// Validate the band table.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Configuration`] if there are no bands,
    /// a cutoff is outside `[0, 1]`, cutoffs are not strictly
    /// decreasing, or any label is empty or repeated.
    pub fn new(config: &ClassifierConfig) -> Result<Self, PipelineError> {
        if config.bands.is_empty() {
            return Err(PipelineError::Configuration(
                "classifier needs at least one band".to_string(),
            ));
        }
        if let Some(band) = config.bands.iter().find(|b| !(0.0..=1.0).contains(&b.above)) {
            return Err(PipelineError::Configuration(format!(
                "band `{}` cutoff {} is outside [0, 1]",
                band.label, band.above
            )));
        }
        if config.bands.windows(2).any(|w| w[0].above <= w[1].above) {
            return Err(PipelineError::Configuration(
                "band cutoffs must be strictly decreasing".to_string(),
            ));
        }
        let labels: Vec<&str> = config
            .bands
            .iter()
            .map(|b| b.label.as_str())
            .chain(std::iter::once(config.fallback.as_str()))
            .collect();
        for (i, label) in labels.iter().enumerate() {
            if label.is_empty() {
                return Err(PipelineError::Configuration(
                    "classification labels must not be empty".to_string(),
                ));
            }
            if labels[..i].contains(label) {
                return Err(PipelineError::Configuration(format!(
                    "duplicate classification label `{label}`"
                )));
            }
        }
        Ok(Self {
            config: config.clone(),
        })
    }

    /// The validated band table.
    #[must_use]
    pub const fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Classify `score`.
    #[must_use]
    pub fn classify(&self, score: f64) -> Classification {
        self.config
            .bands
            .iter()
            .enumerate()
            .find(|(_, band)| score > band.above)
            .map_or_else(
                || Classification {
                    label: self.config.fallback.clone(),
                    rank: self.config.bands.len(),
                },
                |(rank, band)| Classification {
                    label: band.label.clone(),
                    rank,
                },
            )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn classifier() -> Classifier {
        Classifier::new(&ClassifierConfig::default()).unwrap()
    }

    #[test]
    fn default_bands() {
        let c = classifier();
        assert_eq!(c.classify(0.9).label, "high");
        assert_eq!(c.classify(0.7).label, "moderate");
        assert_eq!(c.classify(0.5).label, "low");
        assert_eq!(c.classify(0.1).label, "minimal");
    }

    #[test]
    fn boundary_belongs_to_lower_band() {
        let c = classifier();
        assert_eq!(c.classify(0.85).label, "moderate");
        assert_eq!(c.classify(0.65).label, "low");
        assert_eq!(c.classify(0.45).label, "minimal");
        assert_eq!(c.classify(0.850_001).label, "high");
    }

    #[test]
    fn ranks_are_monotonic() {
        let c = classifier();
        let mut previous = usize::MAX;
        for step in 0..=100 {
            let rank = c.classify(f64::from(step) / 100.0).rank;
            assert!(rank <= previous, "rank rose at step {step}");
            previous = rank;
        }
        assert_eq!(c.classify(0.0).rank, 3);
        assert_eq!(c.classify(1.0).rank, 0);
    }

    #[test]
    fn rejects_unordered_bands() {
        let config = ClassifierConfig {
            bands: vec![Band::new("a", 0.3), Band::new("b", 0.6)],
            fallback: "c".to_string(),
        };
        assert!(matches!(
            Classifier::new(&config),
            Err(PipelineError::Configuration(_))
        ));
    }

    #[test]
    fn rejects_duplicate_labels() {
        let config = ClassifierConfig {
            bands: vec![Band::new("a", 0.6), Band::new("b", 0.3)],
            fallback: "a".to_string(),
        };
        assert!(Classifier::new(&config).is_err());
    }

    #[test]
    fn rejects_cutoff_outside_unit_interval() {
        let config = ClassifierConfig {
            bands: vec![Band::new("a", 1.5)],
            fallback: "b".to_string(),
        };
        assert!(Classifier::new(&config).is_err());
    }
}
