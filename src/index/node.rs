//! The uniform contract every index variant implements.
//!
//! Callers build, search, range-search and (de)serialize any variant
//! through [`IndexNode`] without knowing which backend store sits behind it.

use crate::bitset::BitsetView;
use crate::blob::BinarySet;
use crate::config::Config;
use crate::dataset::{DataSet, RangeSearchResult, SearchResult, Vectors};
use crate::device::DevicePool;
use crate::error::{AnnexError, Result};
use crate::executor::QueryExecutor;
use std::fmt;
use std::sync::Arc;

/// Lifecycle of an index node.
///
/// `Empty -> Trained -> Built`. Flat variants skip straight to `Built` on
/// their first add. Deserialize always lands in `Built`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexState {
    /// No store yet.
    Empty,
    /// Store exists and is trained but holds no rows.
    Trained,
    /// Store holds rows and can be searched.
    Built,
}

impl fmt::Display for IndexState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IndexState::Empty => "empty",
            IndexState::Trained => "trained",
            IndexState::Built => "built",
        };
        f.write_str(name)
    }
}

/// Shared runtime handed to every node at construction.
#[derive(Debug, Clone)]
pub struct IndexContext {
    /// Worker pool used for per-row fan-out.
    pub executor: Arc<QueryExecutor>,
    /// Device pool for device-resident variants.
    pub devices: Option<DevicePool>,
}

impl IndexContext {
    /// Context for CPU-only variants.
    pub fn new(executor: Arc<QueryExecutor>) -> Self {
        Self {
            executor,
            devices: None,
        }
    }

    /// Attach a device pool.
    pub fn with_devices(mut self, devices: DevicePool) -> Self {
        self.devices = Some(devices);
        self
    }

    /// The device pool, or a device error if none is attached.
    pub fn require_devices(&self) -> Result<&DevicePool> {
        self.devices
            .as_ref()
            .ok_or_else(|| AnnexError::device("no device pool configured"))
    }
}

/// Common interface for all index variants.
///
/// # Thread Safety
///
/// Mutating calls take `&mut self` and are therefore exclusive. Searches
/// take `&self` and may run concurrently from several threads.
pub trait IndexNode: Send + Sync {
    /// Train on `dataset` and add it. A failed build leaves the node
    /// in whatever state the failing step left it.
    fn build(&mut self, dataset: &DataSet<'_>, config: &Config) -> Result<()> {
        self.train(dataset, config)?;
        self.add(dataset, config)
    }

    /// Create (or replace) the store and fit it to `dataset`.
    fn train(&mut self, dataset: &DataSet<'_>, config: &Config) -> Result<()>;

    /// Append the rows of `dataset`. Ids are assigned sequentially.
    fn add(&mut self, dataset: &DataSet<'_>, config: &Config) -> Result<()>;

    /// Top-k search for every row of `dataset`.
    ///
    /// Rows with fewer than `k` candidates are padded with id `-1`.
    fn search(
        &self,
        dataset: &DataSet<'_>,
        config: &Config,
        bitset: BitsetView<'_>,
    ) -> Result<SearchResult>;

    /// All hits within `config.radius` (and band) for every row.
    fn range_search(
        &self,
        dataset: &DataSet<'_>,
        config: &Config,
        bitset: BitsetView<'_>,
    ) -> Result<RangeSearchResult>;

    /// Stored rows for the ids carried by `dataset`.
    fn get_vector_by_ids(&self, dataset: &DataSet<'_>) -> Result<Vectors>;

    /// Descriptive metadata about the built index.
    fn get_index_meta(&self, config: &Config) -> Result<serde_json::Value>;

    /// Write the index into `binset`.
    fn serialize(&self, binset: &mut BinarySet) -> Result<()>;

    /// Replace the index with the one stored in `binset`.
    fn deserialize(&mut self, binset: &BinarySet) -> Result<()>;

    /// Dimension of stored rows; 0 when empty.
    fn dim(&self) -> usize;

    /// Approximate bytes held by the store.
    fn size(&self) -> usize;

    /// Number of stored rows.
    fn count(&self) -> usize;

    /// Registry name of the variant.
    fn index_type(&self) -> &str;

    /// Current lifecycle state.
    fn state(&self) -> IndexState;
}

impl fmt::Debug for dyn IndexNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexNode")
            .field("index_type", &self.index_type())
            .field("state", &self.state())
            .field("count", &self.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutorConfig;

    #[test]
    fn test_state_display() {
        assert_eq!(IndexState::Empty.to_string(), "empty");
        assert_eq!(IndexState::Built.to_string(), "built");
    }

    #[test]
    fn test_context_without_devices() {
        let executor = Arc::new(QueryExecutor::new(ExecutorConfig::with_threads(1)).unwrap());
        let ctx = IndexContext::new(executor);
        assert!(matches!(ctx.require_devices(), Err(AnnexError::DeviceError(_))));
    }
}
