//! The terminal output of one analysis.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::aggregate::{CategoryBreakdown, Tier};
use crate::classify::Classification;
use crate::ensemble::{EnsembleScore, TierScore};
use crate::types::InsufficientData;

/// Scores, confidence, label, and per-category breakdown for one image.
///
/// Built once at the end of an analysis and read-only afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticResult {
    final_score: f64,
    confidence: f64,
    label: String,
    label_rank: usize,
    tiers: BTreeMap<Tier, TierScore>,
    categories: BTreeMap<String, CategoryBreakdown>,
    timestamp: DateTime<Utc>,
}

impl DiagnosticResult {
    pub(crate) fn new(
        ensemble: EnsembleScore,
        classification: Classification,
        categories: BTreeMap<String, CategoryBreakdown>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            final_score: ensemble.final_score,
            confidence: ensemble.confidence,
            label: classification.label,
            label_rank: classification.rank,
            tiers: ensemble.tiers,
            categories,
            timestamp,
        }
    }

    /// Final score in `[0, 1]`.
    #[must_use]
    pub const fn final_score(&self) -> f64 {
        self.final_score
    }

    /// Final confidence in `[0, 1]`.
    #[must_use]
    pub const fn confidence(&self) -> f64 {
        self.confidence
    }

    /// Classification label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Rank of the label (0 is the highest band).
    #[must_use]
    pub const fn label_rank(&self) -> usize {
        self.label_rank
    }

    /// Per-tier scores.
    #[must_use]
    pub const fn tiers(&self) -> &BTreeMap<Tier, TierScore> {
        &self.tiers
    }

    /// Per-category breakdowns, keyed by category name.
    #[must_use]
    pub const fn categories(&self) -> &BTreeMap<String, CategoryBreakdown> {
        &self.categories
    }

    /// One category's breakdown.
    #[must_use]
    pub fn category(&self, name: &str) -> Option<&CategoryBreakdown> {
        self.categories.get(name)
    }

    /// When the analysis completed.
    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Every insufficient-data record, deduplicated across categories.
    #[must_use]
    pub fn insufficient(&self) -> Vec<&InsufficientData> {
        let mut out: Vec<&InsufficientData> = Vec::new();
        for record in self.categories.values().flat_map(|c| &c.insufficient) {
            if !out.contains(&record) {
                out.push(record);
            }
        }
        out
    }

    /// Whether any measurement lacked data.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.categories.values().any(|c| !c.insufficient.is_empty())
    }

    /// The result with a different timestamp. Lets callers compare two
    /// analyses field by field.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}
