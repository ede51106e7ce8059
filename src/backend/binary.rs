//! Exact search over bit-packed rows.
//!
//! Hamming distances stay integral while ranking and are converted to
//! `f32` only when handed back.

use super::TopK;
use crate::bitset::BitsetView;
use crate::constants::result::DEFAULT_RANGE_FILTER;
use crate::distance::{hamming_distance, jaccard_distance, MetricType};
use crate::error::{AnnexError, Result};
use crate::range::distance_in_range;
use serde::{Deserialize, Serialize};

/// Row-major packed-bit store. Row `i` has id `i`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryStore {
    metric: MetricType,
    dim: usize,
    code_size: usize,
    codes: Vec<u8>,
}

impl BinaryStore {
    /// Create an empty store for `dim`-bit rows.
    pub fn new(metric: MetricType, dim: usize) -> Result<Self> {
        if !metric.is_binary() {
            return Err(AnnexError::invalid_metric(format!(
                "{metric} is not a binary metric"
            )));
        }
        if dim == 0 || dim % 8 != 0 {
            return Err(AnnexError::invalid_parameter(format!(
                "binary dim must be a positive multiple of 8, got {dim}"
            )));
        }
        Ok(Self {
            metric,
            dim,
            code_size: dim / 8,
            codes: Vec::new(),
        })
    }

    /// Append packed rows. A failed add leaves the store unchanged.
    pub fn add(&mut self, rows: &[u8]) -> Result<()> {
        if rows.len() % self.code_size != 0 {
            return Err(AnnexError::invalid_parameter(format!(
                "buffer of {} bytes is not a multiple of code size {}",
                rows.len(),
                self.code_size
            )));
        }
        self.codes
            .try_reserve(rows.len())
            .map_err(|_| AnnexError::AllocationFailure {
                requested: rows.len(),
            })?;
        self.codes.extend_from_slice(rows);
        Ok(())
    }

    /// Checks the layout of a decoded store.
    pub fn validate(&self) -> Result<()> {
        if !self.metric.is_binary() {
            return Err(AnnexError::invalid_format(format!(
                "{} is not a binary metric",
                self.metric
            )));
        }
        if self.dim == 0 || self.dim % 8 != 0 || self.code_size != self.dim / 8 {
            return Err(AnnexError::invalid_format(format!(
                "binary store has dim {} with code size {}",
                self.dim, self.code_size
            )));
        }
        if self.codes.len() % self.code_size != 0 {
            return Err(AnnexError::invalid_format(format!(
                "binary store holds {} bytes, not a multiple of code size {}",
                self.codes.len(),
                self.code_size
            )));
        }
        Ok(())
    }

    /// Number of stored rows.
    pub fn count(&self) -> usize {
        self.codes.len() / self.code_size
    }

    /// Bits per row.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Metric fixed at creation.
    pub fn metric(&self) -> MetricType {
        self.metric
    }

    /// Bytes held by the codes.
    pub fn size_bytes(&self) -> usize {
        self.codes.len()
    }

    fn check_query(&self, query: &[u8]) -> Result<()> {
        if query.len() != self.code_size {
            return Err(AnnexError::dimension_mismatch(self.dim, query.len() * 8));
        }
        Ok(())
    }

    fn rows(&self) -> impl Iterator<Item = (i64, &[u8])> {
        self.codes
            .chunks_exact(self.code_size)
            .enumerate()
            .map(|(i, code)| (i as i64, code))
    }

    /// The k nearest rows for one query, nearest first.
    pub fn search_row(&self, query: &[u8], k: usize, bitset: BitsetView<'_>) -> Result<Vec<(i64, f32)>> {
        self.check_query(query)?;
        let candidates = self.rows().filter(|(id, _)| !bitset.test(*id));
        match self.metric {
            MetricType::Hamming => {
                let mut top = TopK::<u32>::new(k, false);
                for (id, code) in candidates {
                    top.push(id, hamming_distance(query, code));
                }
                Ok(top
                    .into_sorted()
                    .into_iter()
                    .map(|(id, d)| (id, d as f32))
                    .collect())
            }
            _ => {
                let mut top = TopK::<f32>::new(k, false);
                for (id, code) in candidates {
                    top.push(id, jaccard_distance(query, code));
                }
                Ok(top.into_sorted())
            }
        }
    }

    /// Every row strictly inside `radius`, in id order.
    pub fn range_row(
        &self,
        query: &[u8],
        radius: f32,
        bitset: BitsetView<'_>,
    ) -> Result<(Vec<i64>, Vec<f32>)> {
        self.check_query(query)?;
        let mut ids = Vec::new();
        let mut distances = Vec::new();
        for (id, code) in self.rows().filter(|(id, _)| !bitset.test(*id)) {
            let dist = match self.metric {
                MetricType::Hamming => hamming_distance(query, code) as f32,
                _ => jaccard_distance(query, code),
            };
            if distance_in_range(dist, radius, DEFAULT_RANGE_FILTER, false) {
                ids.push(id);
                distances.push(dist);
            }
        }
        Ok((ids, distances))
    }

    /// The stored code with id `id`.
    pub fn reconstruct(&self, id: i64) -> Result<&[u8]> {
        let i = usize::try_from(id)
            .ok()
            .filter(|&i| i < self.count())
            .ok_or(AnnexError::VectorNotFound(id))?;
        Ok(&self.codes[i * self.code_size..(i + 1) * self.code_size])
    }
}
