//! Index variants behind the [`IndexNode`] contract.
//!
//! | Name | Node |
//! |------|------|
//! | `FLAT` | [`FlatIndexNode`] |
//! | `BINFLAT`, `BIN_FLAT` | [`BinaryFlatIndexNode`] |
//! | `GPU_IVF_FLAT`, `GPU_IVF_PQ`, `GPU_IVF_SQ8` | [`GpuIvfIndexNode`] |

pub mod flat;
pub mod ivf_gpu;
pub mod node;
pub mod registry;

pub use flat::{BinaryFlatIndexNode, FlatIndexNode};
pub use ivf_gpu::{GpuIvfIndexNode, GpuIvfKind};
pub use node::{IndexContext, IndexNode, IndexState};
pub use registry::IndexFactory;

use crate::backend::{alloc_search_result, write_row};
use crate::dataset::{RangeSearchResult, SearchResult};
use crate::distance::MetricType;
use crate::error::{AnnexError, Result};
use crate::executor::QueryExecutor;
use crate::range;
use tracing::warn;

/// Top-k fan-out: one executor task per query row, each writing only its
/// own `k`-wide row of the pre-allocated result.
pub(crate) fn search_rows<F>(
    executor: &QueryExecutor,
    nq: usize,
    k: usize,
    metric: MetricType,
    max_in_flight: Option<usize>,
    row: F,
) -> Result<SearchResult>
where
    F: Fn(usize) -> Result<Vec<(i64, f32)>> + Sync + Send,
{
    let worst = metric.worst_distance();
    let mut result = alloc_search_result(nq, k, worst)?;
    executor
        .run_rows(
            k,
            &mut result.ids,
            &mut result.distances,
            max_in_flight,
            |i, ids, distances| {
                let hits = row(i)?;
                write_row(&hits, ids, distances, worst);
                Ok(())
            },
        )
        .inspect_err(|e| warn!(nq, k, error = %e, "search failed"))?;
    Ok(result)
}

/// Range fan-out: one task per row producing its candidates, then the
/// band filter and flattening once every row is done.
pub(crate) fn range_rows<F>(
    executor: &QueryExecutor,
    nq: usize,
    metric: MetricType,
    radius: f32,
    range_filter: f32,
    max_in_flight: Option<usize>,
    row: F,
) -> Result<RangeSearchResult>
where
    F: Fn(usize) -> Result<(Vec<i64>, Vec<f32>)> + Sync + Send,
{
    let rows = executor
        .map_batch_limited(nq, max_in_flight, row)
        .inspect_err(|e| warn!(nq, radius, error = %e, "range search failed"))?;
    let (ids, distances): (Vec<_>, Vec<_>) = rows.into_iter().unzip();
    range::merge(ids, distances, metric.is_similarity(), radius, range_filter)
}

/// Checks the query dimension against the stored one.
pub(crate) fn check_dim(expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        warn!(expected, actual, "query dimension mismatch");
        return Err(AnnexError::dimension_mismatch(expected, actual));
    }
    Ok(())
}

/// Logs and builds the error for an operation on an empty node.
pub(crate) fn empty_index(op: &str) -> AnnexError {
    warn!(op, "operation on empty index");
    AnnexError::EmptyIndex
}
