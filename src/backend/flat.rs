//! Exact nearest neighbor search over float rows.
//!
//! Computes the score to every stored row and keeps the k best. Serves as
//! the ground truth for the approximate stores.

use super::{TopK, SCAN_CHUNK_SIZE};
use crate::bitset::BitsetView;
use crate::constants::result::DEFAULT_RANGE_FILTER;
use crate::distance::MetricType;
use crate::error::{AnnexError, Result};
use crate::executor::maybe_par_map;
use crate::range::distance_in_range;
use serde::{Deserialize, Serialize};

/// Row-major float store. Row `i` has id `i`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatStore {
    metric: MetricType,
    dim: usize,
    data: Vec<f32>,
}

impl FlatStore {
    /// Create an empty store for `dim`-component rows.
    pub fn new(metric: MetricType, dim: usize) -> Result<Self> {
        if metric.is_binary() {
            return Err(AnnexError::invalid_metric(format!(
                "{metric} is not a float metric"
            )));
        }
        if dim == 0 {
            return Err(AnnexError::invalid_parameter("dim must be greater than 0"));
        }
        Ok(Self {
            metric,
            dim,
            data: Vec::new(),
        })
    }

    /// Append rows. Validates before mutating, so a failed add leaves the
    /// store unchanged.
    pub fn add(&mut self, rows: &[f32]) -> Result<()> {
        if rows.len() % self.dim != 0 {
            return Err(AnnexError::invalid_parameter(format!(
                "buffer of {} floats is not a multiple of dim {}",
                rows.len(),
                self.dim
            )));
        }
        self.data
            .try_reserve(rows.len())
            .map_err(|_| AnnexError::AllocationFailure {
                requested: rows.len(),
            })?;
        self.data.extend_from_slice(rows);
        Ok(())
    }

    /// Checks the layout of a decoded store.
    pub fn validate(&self) -> Result<()> {
        if self.metric.is_binary() {
            return Err(AnnexError::invalid_format(format!(
                "{} is not a float metric",
                self.metric
            )));
        }
        if self.dim == 0 {
            return Err(AnnexError::invalid_format("flat store has dim 0"));
        }
        if self.data.len() % self.dim != 0 {
            return Err(AnnexError::invalid_format(format!(
                "flat store holds {} floats, not a multiple of dim {}",
                self.data.len(),
                self.dim
            )));
        }
        Ok(())
    }

    /// Number of stored rows.
    pub fn count(&self) -> usize {
        self.data.len() / self.dim
    }

    /// Components per row.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Metric fixed at creation.
    pub fn metric(&self) -> MetricType {
        self.metric
    }

    /// Bytes held by the row data.
    pub fn size_bytes(&self) -> usize {
        self.data.len() * std::mem::size_of::<f32>()
    }

    fn check_query(&self, query: &[f32]) -> Result<()> {
        if query.len() != self.dim {
            return Err(AnnexError::dimension_mismatch(self.dim, query.len()));
        }
        Ok(())
    }

    /// The k best rows for one query, best first, skipping excluded ids.
    ///
    /// Scans in parallel chunks unless the calling thread is limited to
    /// one thread.
    pub fn search_row(&self, query: &[f32], k: usize, bitset: BitsetView<'_>) -> Result<Vec<(i64, f32)>> {
        self.check_query(query)?;
        let chunk_rows = SCAN_CHUNK_SIZE;
        let n_chunks = self.count().div_ceil(chunk_rows);

        let partials = maybe_par_map(n_chunks, |c| {
            let start = c * chunk_rows;
            let end = (start + chunk_rows).min(self.count());
            let mut local = TopK::new(k, self.metric.is_similarity());
            for i in start..end {
                let id = i as i64;
                if bitset.test(id) {
                    continue;
                }
                let row = &self.data[i * self.dim..(i + 1) * self.dim];
                local.push(id, self.metric.compute(query, row));
            }
            local
        });

        let mut top = TopK::new(k, self.metric.is_similarity());
        for partial in partials {
            top.merge(partial);
        }
        Ok(top.into_sorted())
    }

    /// Every row strictly inside `radius`, in id order.
    pub fn range_row(
        &self,
        query: &[f32],
        radius: f32,
        bitset: BitsetView<'_>,
    ) -> Result<(Vec<i64>, Vec<f32>)> {
        self.check_query(query)?;
        let is_similarity = self.metric.is_similarity();
        let mut ids = Vec::new();
        let mut distances = Vec::new();
        for (i, row) in self.data.chunks_exact(self.dim).enumerate() {
            let id = i as i64;
            if bitset.test(id) {
                continue;
            }
            let dist = self.metric.compute(query, row);
            if distance_in_range(dist, radius, DEFAULT_RANGE_FILTER, is_similarity) {
                ids.push(id);
                distances.push(dist);
            }
        }
        Ok((ids, distances))
    }

    /// The stored row with id `id`.
    pub fn reconstruct(&self, id: i64) -> Result<&[f32]> {
        let i = usize::try_from(id)
            .ok()
            .filter(|&i| i < self.count())
            .ok_or(AnnexError::VectorNotFound(id))?;
        Ok(&self.data[i * self.dim..(i + 1) * self.dim])
    }
}
