//! Vector codecs for the inverted-file store.
//!
//! - [`ScalarQuantizer`]: 8-bit per-dimension scalar quantization (SQ8)
//! - [`ProductQuantizer`]: product quantization with up to 8-bit codes
//!
//! Product quantization splits D-dimensional vectors into M subvectors and
//! quantizes each subspace independently with its own k-means codebook.
//! Queries stay uncompressed; distances to codes come from a per-query
//! lookup table (asymmetric distance).

use super::kmeans::KMeans;
use crate::constants::kmeans::DEFAULT_MAX_ITERATIONS;
use crate::distance::{dot_product, euclidean_distance_squared, MetricType};
use crate::error::{AnnexError, Result};
use crate::executor::maybe_par_map;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Per-dimension 8-bit scalar quantizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarQuantizer {
    vmin: Vec<f32>,
    vdiff: Vec<f32>,
}

impl ScalarQuantizer {
    /// Learn the value range of every dimension.
    pub fn train(data: &[f32], dim: usize) -> Result<Self> {
        if dim == 0 || data.is_empty() || data.len() % dim != 0 {
            return Err(AnnexError::invalid_parameter(
                "SQ8 training needs at least one full row",
            ));
        }
        let mut vmin = vec![f32::MAX; dim];
        let mut vmax = vec![f32::MIN; dim];
        for row in data.chunks_exact(dim) {
            for (j, &v) in row.iter().enumerate() {
                vmin[j] = vmin[j].min(v);
                vmax[j] = vmax[j].max(v);
            }
        }
        let vdiff = vmax.iter().zip(&vmin).map(|(hi, lo)| hi - lo).collect();
        Ok(Self { vmin, vdiff })
    }

    /// Bytes per encoded row.
    pub fn code_size(&self) -> usize {
        self.vmin.len()
    }

    /// True when the trained ranges cover exactly `dim` dimensions.
    pub(crate) fn fits(&self, dim: usize) -> bool {
        self.vmin.len() == dim && self.vdiff.len() == dim
    }

    /// Encode one row.
    pub fn encode(&self, row: &[f32], out: &mut [u8]) {
        for (j, (&v, code)) in row.iter().zip(out.iter_mut()).enumerate() {
            *code = if self.vdiff[j] > 0.0 {
                ((v - self.vmin[j]) / self.vdiff[j] * 255.0).round().clamp(0.0, 255.0) as u8
            } else {
                0
            };
        }
    }

    /// Decode one row.
    pub fn decode(&self, code: &[u8], out: &mut [f32]) {
        for (j, (&c, v)) in code.iter().zip(out.iter_mut()).enumerate() {
            *v = self.vmin[j] + c as f32 / 255.0 * self.vdiff[j];
        }
    }
}

/// Product quantizer with `m` subspaces of `2^nbits` centroids each.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductQuantizer {
    /// `m * ksub * dsub` codebook components; subspace-major.
    codebooks: Vec<f32>,
    dim: usize,
    m: usize,
    nbits: usize,
    ksub: usize,
    dsub: usize,
}

impl ProductQuantizer {
    /// Checks the PQ shape before any training work.
    pub fn validate(dim: usize, m: usize, nbits: usize) -> Result<()> {
        if m == 0 || dim % m != 0 {
            return Err(AnnexError::invalid_parameter(format!(
                "dim {dim} must be divisible by m {m}"
            )));
        }
        if !(1..=8).contains(&nbits) {
            return Err(AnnexError::invalid_parameter(format!(
                "nbits must be between 1 and 8, got {nbits}"
            )));
        }
        Ok(())
    }

    /// Train one codebook per subspace.
    ///
    /// Needs at least `2^nbits` rows.
    pub fn train(data: &[f32], dim: usize, m: usize, nbits: usize) -> Result<Self> {
        Self::validate(dim, m, nbits)?;
        let ksub = 1usize << nbits;
        let dsub = dim / m;
        let n = data.len() / dim;
        if n < ksub {
            return Err(AnnexError::invalid_parameter(format!(
                "PQ with nbits={nbits} needs at least {ksub} training rows, got {n}"
            )));
        }

        let trained = maybe_par_map(m, |sub| {
            let start = sub * dsub;
            let subvectors: Vec<f32> = data
                .chunks_exact(dim)
                .flat_map(|row| row[start..start + dsub].iter().copied())
                .collect();
            let mut kmeans = KMeans::new(ksub, dsub, DEFAULT_MAX_ITERATIONS);
            kmeans.fit(&subvectors).map(|()| kmeans.centroids)
        });

        let mut codebooks = Vec::with_capacity(m * ksub * dsub);
        for book in trained {
            codebooks.extend(book?);
        }

        Ok(Self {
            codebooks,
            dim,
            m,
            nbits,
            ksub,
            dsub,
        })
    }

    /// Bytes per encoded row.
    pub fn code_size(&self) -> usize {
        self.m
    }

    /// Bits per subspace code.
    pub fn nbits(&self) -> usize {
        self.nbits
    }

    /// True when the codebooks match a `dim`-wide, `m` x `nbits` layout.
    pub(crate) fn fits(&self, dim: usize, m: usize, nbits: usize) -> bool {
        Self::validate(dim, m, nbits).is_ok()
            && self.dim == dim
            && self.m == m
            && self.nbits == nbits
            && self.ksub == 1 << nbits
            && self.dsub * m == dim
            && self.codebooks.len() == m * self.ksub * self.dsub
    }

    #[inline]
    fn centroid(&self, sub: usize, c: usize) -> &[f32] {
        let start = (sub * self.ksub + c) * self.dsub;
        &self.codebooks[start..start + self.dsub]
    }

    /// Encode one row as the nearest centroid index per subspace.
    pub fn encode(&self, row: &[f32], out: &mut [u8]) {
        debug_assert_eq!(row.len(), self.dim);
        for (sub, code) in out.iter_mut().enumerate().take(self.m) {
            let subvector = &row[sub * self.dsub..(sub + 1) * self.dsub];
            *code = (0..self.ksub)
                .map(|c| (c, euclidean_distance_squared(subvector, self.centroid(sub, c))))
                .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal))
                .map_or(0, |(c, _)| c as u8);
        }
    }

    /// Decode one row from its codes.
    pub fn decode(&self, code: &[u8], out: &mut [f32]) {
        for (sub, &c) in code.iter().enumerate().take(self.m) {
            out[sub * self.dsub..(sub + 1) * self.dsub]
                .copy_from_slice(self.centroid(sub, c as usize));
        }
    }

    /// Per-query table: `table[sub * ksub + c]` is the score between the
    /// query's subvector `sub` and centroid `c` of that subspace.
    ///
    /// Layout: [subvector0: ksub floats][subvector1: ksub floats]...
    pub fn lookup_table(&self, query: &[f32], metric: MetricType) -> Vec<f32> {
        let mut table = Vec::with_capacity(self.m * self.ksub);
        for sub in 0..self.m {
            let query_sub = &query[sub * self.dsub..(sub + 1) * self.dsub];
            for c in 0..self.ksub {
                let centroid = self.centroid(sub, c);
                table.push(match metric {
                    MetricType::IP => dot_product(query_sub, centroid),
                    _ => euclidean_distance_squared(query_sub, centroid),
                });
            }
        }
        table
    }

    /// Asymmetric score of one encoded row.
    #[inline]
    pub fn table_distance(&self, table: &[f32], code: &[u8]) -> f32 {
        code.iter()
            .enumerate()
            .map(|(sub, &c)| table[sub * self.ksub + c as usize])
            .sum()
    }
}
