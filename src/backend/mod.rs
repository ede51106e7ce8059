//! Pure-Rust numeric backend behind the index nodes.
//!
//! Each store owns its vectors and answers one query row at a time; the
//! index nodes in [`crate::index`] decide how rows are fanned out.
//!
//! - [`FlatStore`]: exact search over float rows (L2, IP)
//! - [`BinaryStore`]: exact search over packed bits (Hamming, Jaccard)
//! - [`IvfStore`]: inverted lists over k-means cells with flat, SQ8 or PQ codes

pub mod binary;
pub mod flat;
pub mod ivf;
pub mod kmeans;
pub mod quantizer;

pub use binary::BinaryStore;
pub use flat::FlatStore;
pub use ivf::{IvfEncoding, IvfStore};
pub use kmeans::KMeans;
pub use quantizer::{ProductQuantizer, ScalarQuantizer};

use crate::dataset::{try_alloc, SearchResult};
use crate::error::Result;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Rows scanned by one parallel chunk of a flat scan.
pub(crate) const SCAN_CHUNK_SIZE: usize = 1024;

/// A candidate with its score, used for heap operations.
#[derive(Clone, Copy)]
struct ScoredVector<D> {
    id: i64,
    distance: D,
    // similarity metrics rank larger scores first
    reverse: bool,
}

impl<D: PartialOrd> PartialEq for ScoredVector<D> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<D: PartialOrd> Eq for ScoredVector<D> {}

impl<D: PartialOrd> PartialOrd for ScoredVector<D> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<D: PartialOrd> Ord for ScoredVector<D> {
    // Greater means worse, so the max-heap top is the current worst hit.
    fn cmp(&self, other: &Self) -> Ordering {
        let ord = self
            .distance
            .partial_cmp(&other.distance)
            .unwrap_or(Ordering::Equal);
        let ord = if self.reverse { ord.reverse() } else { ord };
        ord.then(self.id.cmp(&other.id))
    }
}

/// Bounded best-k collector. Ties are broken by smaller id.
pub(crate) struct TopK<D> {
    k: usize,
    reverse: bool,
    heap: BinaryHeap<ScoredVector<D>>,
}

impl<D: PartialOrd + Copy> TopK<D> {
    pub(crate) fn new(k: usize, is_similarity: bool) -> Self {
        Self {
            k,
            reverse: is_similarity,
            heap: BinaryHeap::with_capacity(k.min(4096)),
        }
    }

    /// Offer a candidate. Unordered scores (NaN) are dropped.
    #[inline]
    pub(crate) fn push(&mut self, id: i64, distance: D) {
        if self.k == 0 || distance.partial_cmp(&distance).is_none() {
            return;
        }
        let candidate = ScoredVector {
            id,
            distance,
            reverse: self.reverse,
        };
        if self.heap.len() < self.k {
            self.heap.push(candidate);
        } else if let Some(mut worst) = self.heap.peek_mut() {
            if candidate < *worst {
                *worst = candidate;
            }
        }
    }

    /// Fold another collector into this one.
    pub(crate) fn merge(&mut self, other: TopK<D>) {
        for item in other.heap {
            self.push(item.id, item.distance);
        }
    }

    /// Hits ordered best first.
    pub(crate) fn into_sorted(self) -> Vec<(i64, D)> {
        self.heap
            .into_sorted_vec()
            .into_iter()
            .map(|sv| (sv.id, sv.distance))
            .collect()
    }
}

/// Write best-first hits into one output row, padding the tail with the
/// sentinel id and `worst`.
pub(crate) fn write_row(hits: &[(i64, f32)], ids: &mut [i64], distances: &mut [f32], worst: f32) {
    use crate::constants::result::SENTINEL_ID;

    for (slot, (id, dist)) in ids.iter_mut().zip(distances.iter_mut()).enumerate() {
        match hits.get(slot) {
            Some(&(hit_id, hit_dist)) => {
                *id = hit_id;
                *dist = hit_dist;
            }
            None => {
                *id = SENTINEL_ID;
                *dist = worst;
            }
        }
    }
}

/// Output buffers for an `nq x k` search, pre-filled with padding.
pub(crate) fn alloc_search_result(nq: usize, k: usize, worst: f32) -> Result<SearchResult> {
    use crate::constants::result::SENTINEL_ID;
    use crate::error::AnnexError;

    let len = nq
        .checked_mul(k)
        .ok_or(AnnexError::AllocationFailure { requested: usize::MAX })?;
    Ok(SearchResult {
        nq,
        k,
        ids: try_alloc(len, SENTINEL_ID)?,
        distances: try_alloc(len, worst)?,
    })
}
