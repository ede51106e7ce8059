//! Metrics and the distance kernels behind them.
//!
//! Float metrics (`L2`, `IP`) operate on `f32` rows; binary metrics
//! (`HAMMING`, `JACCARD`) operate on bit-packed `u8` rows of `dim / 8` bytes.

pub mod scalar;

pub use scalar::{dot_product, euclidean_distance_squared, hamming_distance, jaccard_distance};

use crate::error::{AnnexError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Supported metrics for similarity search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricType {
    /// Squared Euclidean distance. Lower is closer.
    L2,
    /// Inner product similarity. Higher is closer.
    IP,
    /// Hamming distance over packed bits. Lower is closer.
    Hamming,
    /// Jaccard distance over packed bits. Lower is closer.
    Jaccard,
}

impl MetricType {
    /// True when larger values mean closer (inner product).
    #[inline]
    pub fn is_similarity(self) -> bool {
        matches!(self, MetricType::IP)
    }

    /// True for metrics over bit-packed vectors.
    #[inline]
    pub fn is_binary(self) -> bool {
        matches!(self, MetricType::Hamming | MetricType::Jaccard)
    }

    /// Padding distance for top-k rows with fewer than k hits.
    #[inline]
    pub fn worst_distance(self) -> f32 {
        if self.is_similarity() {
            f32::MIN
        } else {
            f32::MAX
        }
    }

    /// Orders two scores best-first under this metric.
    #[inline]
    pub fn cmp_scores(self, a: f32, b: f32) -> Ordering {
        let ord = a.partial_cmp(&b).unwrap_or(Ordering::Equal);
        if self.is_similarity() {
            ord.reverse()
        } else {
            ord
        }
    }

    /// True when `a` ranks strictly ahead of `b`.
    #[inline]
    pub fn is_better(self, a: f32, b: f32) -> bool {
        self.cmp_scores(a, b) == Ordering::Less
    }

    /// Score between two float rows.
    ///
    /// # Panics
    /// Panics in debug builds if the rows have different lengths.
    #[inline]
    pub fn compute(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            MetricType::L2 => euclidean_distance_squared(a, b),
            MetricType::IP => dot_product(a, b),
            // binary metrics never reach the float path; callers validate first
            MetricType::Hamming | MetricType::Jaccard => f32::NAN,
        }
    }

    /// Canonical upper-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            MetricType::L2 => "L2",
            MetricType::IP => "IP",
            MetricType::Hamming => "HAMMING",
            MetricType::Jaccard => "JACCARD",
        }
    }
}

impl FromStr for MetricType {
    type Err = AnnexError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "L2" => Ok(MetricType::L2),
            "IP" => Ok(MetricType::IP),
            "HAMMING" => Ok(MetricType::Hamming),
            "JACCARD" => Ok(MetricType::Jaccard),
            other => Err(AnnexError::invalid_metric(format!(
                "unknown metric type '{other}'"
            ))),
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
