//! annex: execution core for pluggable nearest-neighbor indexes.
//!
//! Every index variant is driven through the [`IndexNode`] contract, so
//! callers can build, search, range-search and (de)serialize flat, binary
//! and device-resident IVF indexes interchangeably.
//!
//! # Features
//!
//! - **Query Executor**: per-row fan-out over one fixed rayon pool, with
//!   ordered results and nested parallelism pinned to one thread per task
//! - **Device Lease Pool**: exclusive, RAII-released leases on a fixed set
//!   of devices, with timeouts and per-device memory budgets
//! - **Range Merger**: radius and band filtering, best-first row ordering
//!   and flattening into `ids` / `distances` / `lims`
//! - **Index Variants**: `FLAT`, `BIN_FLAT`, `GPU_IVF_FLAT`, `GPU_IVF_PQ`,
//!   `GPU_IVF_SQ8`
//!
//! # Example
//!
//! ```
//! use annex::{BitsetView, Config, DataSet, ExecutorConfig, IndexContext, IndexFactory, QueryExecutor};
//! use std::sync::Arc;
//!
//! let executor = Arc::new(QueryExecutor::new(ExecutorConfig::with_threads(2)).unwrap());
//! let ctx = IndexContext::new(executor);
//! let mut index = IndexFactory::new().create("FLAT", &ctx).unwrap();
//!
//! let data: Vec<f32> = (0..16).map(|i| i as f32).collect();
//! let base = DataSet::from_f32(8, 2, &data).unwrap();
//! index.build(&base, &Config::default()).unwrap();
//!
//! let query = DataSet::from_f32(1, 2, &data[4..6]).unwrap();
//! let result = index.search(&query, &Config::default().with_k(3), BitsetView::Empty).unwrap();
//! assert_eq!(result.row_ids(0)[0], 2);
//! ```

pub mod backend;
pub mod bitset;
pub mod blob;
pub mod config;
pub mod constants;
pub mod dataset;
pub mod device;
pub mod distance;
pub mod error;
pub mod executor;
pub mod index;
pub mod range;

// Re-export commonly used types at crate root
pub use bitset::BitsetView;
pub use blob::{Binary, BinarySet};
pub use config::{Config, DevicePoolConfig, DeviceSpec, ExecutorConfig};
pub use dataset::{recall_at_k, DataSet, RangeSearchResult, SearchResult, Tensor, Vectors};
pub use device::{DeviceAllocation, DeviceContext, DevicePool, Lease, WeakLease};
pub use distance::MetricType;
pub use error::{AnnexError, Result};
pub use executor::{QueryExecutor, ScopedThreadLimit};
pub use index::{
    BinaryFlatIndexNode, FlatIndexNode, GpuIvfIndexNode, GpuIvfKind, IndexContext, IndexFactory,
    IndexNode, IndexState,
};
