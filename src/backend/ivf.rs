//! Inverted File (IVF) store for approximate nearest neighbor search.
//!
//! Rows are partitioned into `nlist` cells by a k-means coarse quantizer
//! and stored in per-cell inverted lists, encoded as raw floats, SQ8 or PQ
//! codes. A query scans only its `nprobe` best cells.

use super::kmeans::KMeans;
use super::quantizer::{ProductQuantizer, ScalarQuantizer};
use super::TopK;
use crate::bitset::BitsetView;
use crate::constants::kmeans::DEFAULT_MAX_ITERATIONS;
use crate::distance::MetricType;
use crate::error::{AnnexError, Result};
use crate::executor::maybe_par_map;
use serde::{Deserialize, Serialize};

/// How rows are stored inside the inverted lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IvfEncoding {
    /// Raw `f32` rows.
    Flat,
    /// One byte per dimension.
    Sq8,
    /// `m` product-quantizer codes of `nbits` bits.
    Pq {
        /// Subquantizers.
        m: usize,
        /// Bits per code.
        nbits: usize,
    },
}

impl IvfEncoding {
    /// Short name used in logs and type strings.
    pub fn name(&self) -> &'static str {
        match self {
            IvfEncoding::Flat => "IVF_FLAT",
            IvfEncoding::Sq8 => "IVF_SQ8",
            IvfEncoding::Pq { .. } => "IVF_PQ",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Codec {
    Flat,
    Sq8(ScalarQuantizer),
    Pq(ProductQuantizer),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct InvertedList {
    ids: Vec<i64>,
    codes: Vec<u8>,
}

/// Trained coarse quantizer plus codec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Trained {
    coarse: KMeans,
    codec: Codec,
}

/// Inverted-file store. Ids are assigned sequentially in add order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IvfStore {
    metric: MetricType,
    dim: usize,
    nlist: usize,
    encoding: IvfEncoding,
    trained: Option<Trained>,
    lists: Vec<InvertedList>,
    ntotal: usize,
}

impl IvfStore {
    /// Create an untrained store.
    pub fn new(metric: MetricType, dim: usize, nlist: usize, encoding: IvfEncoding) -> Result<Self> {
        if metric.is_binary() {
            return Err(AnnexError::invalid_metric(format!(
                "{metric} is not supported by IVF"
            )));
        }
        if dim == 0 || nlist == 0 {
            return Err(AnnexError::invalid_parameter(
                "IVF needs dim > 0 and nlist > 0",
            ));
        }
        if let IvfEncoding::Pq { m, nbits } = encoding {
            ProductQuantizer::validate(dim, m, nbits)?;
        }
        Ok(Self {
            metric,
            dim,
            nlist,
            encoding,
            trained: None,
            lists: Vec::new(),
            ntotal: 0,
        })
    }

    /// Checks the layout of a decoded store: shapes of the quantizers,
    /// one list per cell, codes aligned with ids and ids within `ntotal`.
    pub fn validate(&self) -> Result<()> {
        if self.metric.is_binary() || self.dim == 0 || self.nlist == 0 {
            return Err(AnnexError::invalid_format(format!(
                "IVF store with metric {}, dim {}, nlist {}",
                self.metric, self.dim, self.nlist
            )));
        }
        if let IvfEncoding::Pq { m, nbits } = self.encoding {
            ProductQuantizer::validate(self.dim, m, nbits)
                .map_err(|e| AnnexError::invalid_format(e.to_string()))?;
        }

        let Some(trained) = &self.trained else {
            if !self.lists.is_empty() || self.ntotal != 0 {
                return Err(AnnexError::invalid_format("untrained IVF store holds rows"));
            }
            return Ok(());
        };
        let coarse = &trained.coarse;
        if coarse.k() != self.nlist
            || coarse.dim() != self.dim
            || coarse.centroids.len() != self.nlist * self.dim
        {
            return Err(AnnexError::invalid_format(format!(
                "coarse quantizer holds {} components, expected {} x {}",
                coarse.centroids.len(),
                self.nlist,
                self.dim
            )));
        }
        let codec_fits = match (&trained.codec, self.encoding) {
            (Codec::Flat, IvfEncoding::Flat) => true,
            (Codec::Sq8(sq), IvfEncoding::Sq8) => sq.fits(self.dim),
            (Codec::Pq(pq), IvfEncoding::Pq { m, nbits }) => pq.fits(self.dim, m, nbits),
            _ => false,
        };
        if !codec_fits {
            return Err(AnnexError::invalid_format(format!(
                "codec does not match {}",
                self.encoding.name()
            )));
        }

        if self.lists.len() != self.nlist {
            return Err(AnnexError::invalid_format(format!(
                "{} inverted lists, expected {}",
                self.lists.len(),
                self.nlist
            )));
        }
        let code_size = self.code_size();
        let mut total = 0usize;
        for (c, list) in self.lists.iter().enumerate() {
            if list.codes.len() != list.ids.len() * code_size {
                return Err(AnnexError::invalid_format(format!(
                    "list {c}: {} code bytes for {} ids",
                    list.codes.len(),
                    list.ids.len()
                )));
            }
            if list.ids.iter().any(|&id| id < 0 || id as usize >= self.ntotal) {
                return Err(AnnexError::invalid_format(format!("list {c}: id out of range")));
            }
            total += list.ids.len();
        }
        if total != self.ntotal {
            return Err(AnnexError::invalid_format(format!(
                "lists hold {total} rows, header says {}",
                self.ntotal
            )));
        }
        Ok(())
    }

    /// True once `train` has succeeded.
    pub fn is_trained(&self) -> bool {
        self.trained.is_some()
    }

    /// Number of stored rows.
    pub fn count(&self) -> usize {
        self.ntotal
    }

    /// Components per row.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of inverted lists.
    pub fn nlist(&self) -> usize {
        self.nlist
    }

    /// Metric fixed at creation.
    pub fn metric(&self) -> MetricType {
        self.metric
    }

    /// Row encoding.
    pub fn encoding(&self) -> IvfEncoding {
        self.encoding
    }

    fn code_size(&self) -> usize {
        match self.encoding {
            IvfEncoding::Flat => self.dim * std::mem::size_of::<f32>(),
            IvfEncoding::Sq8 => self.dim,
            IvfEncoding::Pq { m, .. } => m,
        }
    }

    /// Bytes needed to hold the store: centroids, codebooks, codes and ids.
    pub fn size_bytes(&self) -> usize {
        let f = std::mem::size_of::<f32>();
        let centroids = self.nlist * self.dim * f;
        let codec = match self.encoding {
            IvfEncoding::Flat => 0,
            IvfEncoding::Sq8 => 2 * self.dim * f,
            IvfEncoding::Pq { nbits, .. } => (1usize << nbits) * self.dim * f,
        };
        centroids + codec + self.bytes_for_rows(self.ntotal)
    }

    /// Bytes taken by `n` encoded rows and their ids.
    pub fn bytes_for_rows(&self, n: usize) -> usize {
        n * (self.code_size() + std::mem::size_of::<i64>())
    }

    fn check_rows(&self, data: &[f32]) -> Result<usize> {
        if data.len() % self.dim != 0 {
            return Err(AnnexError::invalid_parameter(format!(
                "buffer of {} floats is not a multiple of dim {}",
                data.len(),
                self.dim
            )));
        }
        Ok(data.len() / self.dim)
    }

    /// Train the coarse quantizer and codec.
    pub fn train(&mut self, data: &[f32]) -> Result<()> {
        if self.is_trained() {
            return Err(AnnexError::IndexAlreadyTrained);
        }
        self.check_rows(data)?;

        let mut coarse = KMeans::new(self.nlist, self.dim, DEFAULT_MAX_ITERATIONS);
        coarse.fit(data)?;
        let codec = match self.encoding {
            IvfEncoding::Flat => Codec::Flat,
            IvfEncoding::Sq8 => Codec::Sq8(ScalarQuantizer::train(data, self.dim)?),
            IvfEncoding::Pq { m, nbits } => {
                Codec::Pq(ProductQuantizer::train(data, self.dim, m, nbits)?)
            }
        };

        self.trained = Some(Trained { coarse, codec });
        self.lists = vec![InvertedList::default(); self.nlist];
        Ok(())
    }

    fn trained(&self) -> Result<&Trained> {
        self.trained.as_ref().ok_or(AnnexError::IndexNotTrained)
    }

    /// Cells ordered best first for `query` under the store metric.
    fn nearest_cells(&self, trained: &Trained, query: &[f32], nprobe: usize) -> Vec<usize> {
        if self.metric == MetricType::L2 {
            return trained.coarse.nearest_n(query, nprobe);
        }
        let mut scored: Vec<(usize, f32)> = (0..self.nlist)
            .map(|c| (c, self.metric.compute(query, trained.coarse.centroid(c))))
            .collect();
        scored.sort_by(|a, b| self.metric.cmp_scores(a.1, b.1));
        scored.truncate(nprobe);
        scored.into_iter().map(|(c, _)| c).collect()
    }

    fn encode(codec: &Codec, row: &[f32], out: &mut [u8]) {
        match codec {
            Codec::Flat => {
                for (v, bytes) in row.iter().zip(out.chunks_exact_mut(4)) {
                    bytes.copy_from_slice(&v.to_le_bytes());
                }
            }
            Codec::Sq8(sq) => sq.encode(row, out),
            Codec::Pq(pq) => pq.encode(row, out),
        }
    }

    /// Append rows. Every row is assigned and encoded before any list is
    /// touched, so a failed add leaves the store unchanged.
    pub fn add(&mut self, data: &[f32]) -> Result<()> {
        let trained = self.trained()?;
        let n = self.check_rows(data)?;
        let code_size = self.code_size();

        let encoded = maybe_par_map(n, |i| {
            let row = &data[i * self.dim..(i + 1) * self.dim];
            let cell = self.nearest_cells(trained, row, 1).first().copied().unwrap_or(0);
            let mut code = vec![0u8; code_size];
            Self::encode(&trained.codec, row, &mut code);
            (cell, code)
        });

        let mut per_list = vec![0usize; self.nlist];
        for (cell, _) in &encoded {
            per_list[*cell] += 1;
        }
        for (list, &extra) in self.lists.iter_mut().zip(&per_list) {
            let failed = list.ids.try_reserve(extra).is_err()
                || list.codes.try_reserve(extra * code_size).is_err();
            if failed {
                return Err(AnnexError::AllocationFailure {
                    requested: extra * code_size,
                });
            }
        }

        let base = self.ntotal as i64;
        for (i, (cell, code)) in encoded.into_iter().enumerate() {
            let list = &mut self.lists[cell];
            list.ids.push(base + i as i64);
            list.codes.extend_from_slice(&code);
        }
        self.ntotal += n;
        Ok(())
    }

    /// The k best rows for one query among the `nprobe` best cells.
    ///
    /// `nprobe` is clamped to `1..=nlist`: a value above `nlist` scans
    /// every cell. Callers reject `nprobe == 0` before reaching here.
    pub fn search_row(
        &self,
        query: &[f32],
        k: usize,
        nprobe: usize,
        bitset: BitsetView<'_>,
    ) -> Result<Vec<(i64, f32)>> {
        let trained = self.trained()?;
        if query.len() != self.dim {
            return Err(AnnexError::dimension_mismatch(self.dim, query.len()));
        }
        let nprobe = nprobe.clamp(1, self.nlist);
        let code_size = self.code_size();
        let mut top = TopK::new(k, self.metric.is_similarity());

        let table = match &trained.codec {
            Codec::Pq(pq) => Some(pq.lookup_table(query, self.metric)),
            _ => None,
        };
        let mut decoded = vec![0f32; self.dim];

        for cell in self.nearest_cells(trained, query, nprobe) {
            let list = &self.lists[cell];
            for (&id, code) in list.ids.iter().zip(list.codes.chunks_exact(code_size)) {
                if bitset.test(id) {
                    continue;
                }
                let dist = match (&trained.codec, &table) {
                    (Codec::Pq(pq), Some(table)) => pq.table_distance(table, code),
                    (Codec::Sq8(sq), _) => {
                        sq.decode(code, &mut decoded);
                        self.metric.compute(query, &decoded)
                    }
                    _ => {
                        for (v, bytes) in decoded.iter_mut().zip(code.chunks_exact(4)) {
                            *v = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                        }
                        self.metric.compute(query, &decoded)
                    }
                };
                top.push(id, dist);
            }
        }
        Ok(top.into_sorted())
    }
}
