//! Borrowed input views and owned result tables.
//!
//! A [`DataSet`] never owns its rows: it borrows a caller buffer for the
//! duration of one call. Results are owned and row-major.

use crate::constants::result::SENTINEL_ID;
use crate::error::{AnnexError, Result};
use std::collections::HashSet;

/// Row storage behind a [`DataSet`].
#[derive(Debug, Clone, Copy)]
pub enum Tensor<'a> {
    /// `rows * dim` floats.
    Float(&'a [f32]),
    /// `rows * dim / 8` bytes of packed bits.
    Binary(&'a [u8]),
    /// No row data (id-only datasets).
    None,
}

/// Immutable view over a caller-owned row-major buffer.
#[derive(Debug, Clone, Copy)]
pub struct DataSet<'a> {
    rows: usize,
    dim: usize,
    tensor: Tensor<'a>,
    ids: Option<&'a [i64]>,
}

impl<'a> DataSet<'a> {
    /// View `rows` float vectors of `dim` components.
    pub fn from_f32(rows: usize, dim: usize, data: &'a [f32]) -> Result<Self> {
        if dim == 0 {
            return Err(AnnexError::invalid_parameter("dim must be greater than 0"));
        }
        let expected = rows
            .checked_mul(dim)
            .ok_or_else(|| AnnexError::invalid_parameter("rows * dim overflows"))?;
        if data.len() != expected {
            return Err(AnnexError::invalid_parameter(format!(
                "buffer holds {} floats, expected {rows} x {dim}",
                data.len()
            )));
        }
        Ok(Self {
            rows,
            dim,
            tensor: Tensor::Float(data),
            ids: None,
        })
    }

    /// View `rows` packed binary vectors of `dim` bits (`dim / 8` bytes each).
    pub fn from_binary(rows: usize, dim: usize, data: &'a [u8]) -> Result<Self> {
        if dim == 0 || dim % 8 != 0 {
            return Err(AnnexError::invalid_parameter(format!(
                "binary dim must be a positive multiple of 8, got {dim}"
            )));
        }
        let expected = rows
            .checked_mul(dim / 8)
            .ok_or_else(|| AnnexError::invalid_parameter("rows * dim overflows"))?;
        if data.len() != expected {
            return Err(AnnexError::invalid_parameter(format!(
                "buffer holds {} bytes, expected {rows} x {}",
                data.len(),
                dim / 8
            )));
        }
        Ok(Self {
            rows,
            dim,
            tensor: Tensor::Binary(data),
            ids: None,
        })
    }

    /// An id-only dataset, as passed to `get_vector_by_ids`.
    pub fn from_ids(ids: &'a [i64]) -> Self {
        Self {
            rows: ids.len(),
            dim: 0,
            tensor: Tensor::None,
            ids: Some(ids),
        }
    }

    /// Attach external ids, one per row.
    pub fn with_ids(mut self, ids: &'a [i64]) -> Result<Self> {
        if ids.len() != self.rows {
            return Err(AnnexError::invalid_parameter(format!(
                "{} ids for {} rows",
                ids.len(),
                self.rows
            )));
        }
        self.ids = Some(ids);
        Ok(self)
    }

    /// Number of rows.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Dimension in components (floats) or bits (binary).
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// External ids, if attached.
    pub fn ids(&self) -> Option<&'a [i64]> {
        self.ids
    }

    /// The underlying storage.
    pub fn tensor(&self) -> Tensor<'a> {
        self.tensor
    }

    /// The float buffer, or an error for binary/id-only data.
    pub fn as_f32(&self) -> Result<&'a [f32]> {
        match self.tensor {
            Tensor::Float(data) => Ok(data),
            _ => Err(AnnexError::invalid_parameter("expected a float dataset")),
        }
    }

    /// The packed-bit buffer, or an error for float/id-only data.
    pub fn as_binary(&self) -> Result<&'a [u8]> {
        match self.tensor {
            Tensor::Binary(data) => Ok(data),
            _ => Err(AnnexError::invalid_parameter("expected a binary dataset")),
        }
    }

    /// The external ids, or an error if none were attached.
    pub fn require_ids(&self) -> Result<&'a [i64]> {
        self.ids
            .ok_or_else(|| AnnexError::invalid_parameter("dataset carries no ids"))
    }
}

/// Allocate a `len`-element buffer filled with `value`, reporting
/// allocation failure instead of aborting.
pub fn try_alloc<T: Clone>(len: usize, value: T) -> Result<Vec<T>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| AnnexError::AllocationFailure { requested: len })?;
    buf.resize(len, value);
    Ok(buf)
}

/// Fixed-width top-k result table.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    /// Number of query rows.
    pub nq: usize,
    /// Width of every row.
    pub k: usize,
    /// `nq * k` ids, `-1` for empty slots.
    pub ids: Vec<i64>,
    /// `nq * k` distances, the metric's worst value for empty slots.
    pub distances: Vec<f32>,
}

impl SearchResult {
    /// Ids of row `i`.
    pub fn row_ids(&self, i: usize) -> &[i64] {
        &self.ids[i * self.k..(i + 1) * self.k]
    }

    /// Distances of row `i`.
    pub fn row_distances(&self, i: usize) -> &[f32] {
        &self.distances[i * self.k..(i + 1) * self.k]
    }

    /// Non-sentinel hits in row `i`.
    pub fn valid_in_row(&self, i: usize) -> usize {
        self.row_ids(i).iter().filter(|&&id| id != SENTINEL_ID).count()
    }
}

/// Ragged range search result.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RangeSearchResult {
    /// All hits, concatenated in row order.
    pub ids: Vec<i64>,
    /// Distances parallel to `ids`.
    pub distances: Vec<f32>,
    /// `nq + 1` offsets; row `i` is `lims[i]..lims[i + 1]`.
    pub lims: Vec<usize>,
}

impl RangeSearchResult {
    /// Number of query rows.
    pub fn nq(&self) -> usize {
        self.lims.len().saturating_sub(1)
    }

    /// Hits of row `i`.
    pub fn row(&self, i: usize) -> (&[i64], &[f32]) {
        let range = self.lims[i]..self.lims[i + 1];
        (&self.ids[range.clone()], &self.distances[range])
    }

    /// Total number of hits.
    pub fn total(&self) -> usize {
        self.ids.len()
    }
}

/// Reconstructed vectors returned by `get_vector_by_ids`.
#[derive(Debug, Clone, PartialEq)]
pub enum Vectors {
    /// Row-major floats.
    Float {
        /// Components per row.
        dim: usize,
        /// `rows * dim` floats.
        data: Vec<f32>,
    },
    /// Row-major packed bits.
    Binary {
        /// Bits per row.
        dim: usize,
        /// `rows * dim / 8` bytes.
        data: Vec<u8>,
    },
}

/// Compute recall@k between predicted and ground truth ids.
///
/// Sentinel ids are ignored. Returns a value between 0.0 and 1.0.
pub fn recall_at_k(predicted: &[i64], ground_truth: &[i64], k: usize) -> f32 {
    let pred_set: HashSet<i64> = predicted
        .iter()
        .take(k)
        .copied()
        .filter(|&id| id != SENTINEL_ID)
        .collect();
    let truth_set: HashSet<i64> = ground_truth.iter().take(k).copied().collect();

    let intersection = pred_set.intersection(&truth_set).count();
    intersection as f32 / k as f32
}
