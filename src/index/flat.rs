//! Brute-force index nodes over float and bit-packed rows.
//!
//! Both nodes search exactly: every query row becomes one executor task
//! that scans the whole store. Training only fixes metric and dimension.

use super::node::{IndexContext, IndexNode, IndexState};
use super::{check_dim, empty_index, range_rows, search_rows};
use crate::backend::{BinaryStore, FlatStore};
use crate::bitset::BitsetView;
use crate::blob::BinarySet;
use crate::config::Config;
use crate::constants::blob;
use crate::dataset::{try_alloc, DataSet, RangeSearchResult, SearchResult, Vectors};
use crate::error::{AnnexError, Result};
use tracing::{debug, warn};

/// Exact float index (`FLAT`).
#[derive(Debug)]
pub struct FlatIndexNode {
    ctx: IndexContext,
    store: Option<FlatStore>,
}

impl FlatIndexNode {
    /// Create an empty node.
    pub fn new(ctx: IndexContext) -> Self {
        Self { ctx, store: None }
    }

    fn store(&self, op: &str) -> Result<&FlatStore> {
        self.store.as_ref().ok_or_else(|| empty_index(op))
    }
}

impl IndexNode for FlatIndexNode {
    fn train(&mut self, dataset: &DataSet<'_>, config: &Config) -> Result<()> {
        let metric = config.metric()?;
        dataset.as_f32()?;
        let store = FlatStore::new(metric, dataset.dim())?;
        if self.store.take().is_some() {
            warn!("index not empty, replaced old index");
        }
        self.store = Some(store);
        Ok(())
    }

    fn add(&mut self, dataset: &DataSet<'_>, config: &Config) -> Result<()> {
        let rows = dataset.as_f32()?;
        if self.store.is_none() {
            self.store = Some(FlatStore::new(config.metric()?, dataset.dim())?);
        }
        let store = self.store.as_mut().ok_or(AnnexError::EmptyIndex)?;
        check_dim(store.dim(), dataset.dim())?;
        let build = config.build_thread_num;
        self.ctx.executor.run_build(build, || store.add(rows))?;
        debug!(added = dataset.rows(), total = store.count(), "flat add");
        Ok(())
    }

    fn search(
        &self,
        dataset: &DataSet<'_>,
        config: &Config,
        bitset: BitsetView<'_>,
    ) -> Result<SearchResult> {
        let store = self.store("search")?;
        config.validate_search()?;
        let queries = dataset.as_f32()?;
        check_dim(store.dim(), dataset.dim())?;

        let dim = store.dim();
        let k = config.k;
        search_rows(
            &self.ctx.executor,
            dataset.rows(),
            k,
            store.metric(),
            config.query_thread_num,
            |i| store.search_row(&queries[i * dim..(i + 1) * dim], k, bitset),
        )
    }

    fn range_search(
        &self,
        dataset: &DataSet<'_>,
        config: &Config,
        bitset: BitsetView<'_>,
    ) -> Result<RangeSearchResult> {
        let store = self.store("range search")?;
        let (radius, range_filter) = config.validate_range_search(store.metric())?;
        if config.query_thread_num == Some(0) {
            return Err(AnnexError::invalid_parameter(
                "query_thread_num must be greater than 0",
            ));
        }
        let queries = dataset.as_f32()?;
        check_dim(store.dim(), dataset.dim())?;

        let dim = store.dim();
        range_rows(
            &self.ctx.executor,
            dataset.rows(),
            store.metric(),
            radius,
            range_filter,
            config.query_thread_num,
            |i| store.range_row(&queries[i * dim..(i + 1) * dim], radius, bitset),
        )
    }

    fn get_vector_by_ids(&self, dataset: &DataSet<'_>) -> Result<Vectors> {
        let store = self.store("get_vector_by_ids")?;
        let ids = dataset.require_ids()?;
        let dim = store.dim();
        let mut data = try_alloc(ids.len() * dim, 0.0f32)?;
        for (&id, out) in ids.iter().zip(data.chunks_exact_mut(dim)) {
            out.copy_from_slice(store.reconstruct(id)?);
        }
        Ok(Vectors::Float { dim, data })
    }

    fn get_index_meta(&self, _config: &Config) -> Result<serde_json::Value> {
        Err(AnnexError::not_implemented("index meta for FLAT"))
    }

    fn serialize(&self, binset: &mut BinarySet) -> Result<()> {
        if self.state() != IndexState::Built {
            return Err(empty_index("serialize"));
        }
        let store = self.store("serialize")?;
        binset.append(blob::FLAT, bincode::serialize(store)?);
        Ok(())
    }

    fn deserialize(&mut self, binset: &BinarySet) -> Result<()> {
        let bytes = binset.get_by_name(blob::FLAT)?;
        let store: FlatStore = bincode::deserialize(bytes.data())?;
        store
            .validate()
            .inspect_err(|e| warn!(error = %e, "rejected FLAT payload"))?;
        self.store = None;
        debug!(count = store.count(), dim = store.dim(), "flat index loaded");
        self.store = Some(store);
        Ok(())
    }

    fn dim(&self) -> usize {
        self.store.as_ref().map_or(0, FlatStore::dim)
    }

    fn size(&self) -> usize {
        self.store.as_ref().map_or(0, FlatStore::size_bytes)
    }

    fn count(&self) -> usize {
        self.store.as_ref().map_or(0, FlatStore::count)
    }

    fn index_type(&self) -> &str {
        "FLAT"
    }

    fn state(&self) -> IndexState {
        match &self.store {
            None => IndexState::Empty,
            Some(store) if store.count() == 0 => IndexState::Trained,
            Some(_) => IndexState::Built,
        }
    }
}

/// Exact index over packed bits (`BIN_FLAT`).
#[derive(Debug)]
pub struct BinaryFlatIndexNode {
    ctx: IndexContext,
    store: Option<BinaryStore>,
}

impl BinaryFlatIndexNode {
    /// Create an empty node.
    pub fn new(ctx: IndexContext) -> Self {
        Self { ctx, store: None }
    }

    fn store(&self, op: &str) -> Result<&BinaryStore> {
        self.store.as_ref().ok_or_else(|| empty_index(op))
    }
}

impl IndexNode for BinaryFlatIndexNode {
    fn train(&mut self, dataset: &DataSet<'_>, config: &Config) -> Result<()> {
        let metric = config.metric()?;
        dataset.as_binary()?;
        let store = BinaryStore::new(metric, dataset.dim())?;
        if self.store.take().is_some() {
            warn!("index not empty, replaced old index");
        }
        self.store = Some(store);
        Ok(())
    }

    fn add(&mut self, dataset: &DataSet<'_>, config: &Config) -> Result<()> {
        let rows = dataset.as_binary()?;
        if self.store.is_none() {
            self.store = Some(BinaryStore::new(config.metric()?, dataset.dim())?);
        }
        let store = self.store.as_mut().ok_or(AnnexError::EmptyIndex)?;
        check_dim(store.dim(), dataset.dim())?;
        let build = config.build_thread_num;
        self.ctx.executor.run_build(build, || store.add(rows))?;
        debug!(added = dataset.rows(), total = store.count(), "binary flat add");
        Ok(())
    }

    fn search(
        &self,
        dataset: &DataSet<'_>,
        config: &Config,
        bitset: BitsetView<'_>,
    ) -> Result<SearchResult> {
        let store = self.store("search")?;
        config.validate_search()?;
        let queries = dataset.as_binary()?;
        check_dim(store.dim(), dataset.dim())?;

        let code_size = store.dim() / 8;
        let k = config.k;
        search_rows(
            &self.ctx.executor,
            dataset.rows(),
            k,
            store.metric(),
            config.query_thread_num,
            |i| store.search_row(&queries[i * code_size..(i + 1) * code_size], k, bitset),
        )
    }

    fn range_search(
        &self,
        dataset: &DataSet<'_>,
        config: &Config,
        bitset: BitsetView<'_>,
    ) -> Result<RangeSearchResult> {
        let store = self.store("range search")?;
        let (radius, range_filter) = config.validate_range_search(store.metric())?;
        if config.query_thread_num == Some(0) {
            return Err(AnnexError::invalid_parameter(
                "query_thread_num must be greater than 0",
            ));
        }
        let queries = dataset.as_binary()?;
        check_dim(store.dim(), dataset.dim())?;

        let code_size = store.dim() / 8;
        range_rows(
            &self.ctx.executor,
            dataset.rows(),
            store.metric(),
            radius,
            range_filter,
            config.query_thread_num,
            |i| store.range_row(&queries[i * code_size..(i + 1) * code_size], radius, bitset),
        )
    }

    fn get_vector_by_ids(&self, dataset: &DataSet<'_>) -> Result<Vectors> {
        let store = self.store("get_vector_by_ids")?;
        let ids = dataset.require_ids()?;
        let code_size = store.dim() / 8;
        let mut data = try_alloc(ids.len() * code_size, 0u8)?;
        for (&id, out) in ids.iter().zip(data.chunks_exact_mut(code_size)) {
            out.copy_from_slice(store.reconstruct(id)?);
        }
        Ok(Vectors::Binary {
            dim: store.dim(),
            data,
        })
    }

    fn get_index_meta(&self, _config: &Config) -> Result<serde_json::Value> {
        Err(AnnexError::not_implemented("index meta for BIN_FLAT"))
    }

    fn serialize(&self, binset: &mut BinarySet) -> Result<()> {
        if self.state() != IndexState::Built {
            return Err(empty_index("serialize"));
        }
        let store = self.store("serialize")?;
        binset.append(blob::BIN_FLAT, bincode::serialize(store)?);
        Ok(())
    }

    fn deserialize(&mut self, binset: &BinarySet) -> Result<()> {
        let bytes = binset.get_by_name(blob::BIN_FLAT)?;
        let store: BinaryStore = bincode::deserialize(bytes.data())?;
        store
            .validate()
            .inspect_err(|e| warn!(error = %e, "rejected BIN_FLAT payload"))?;
        self.store = None;
        debug!(count = store.count(), dim = store.dim(), "binary flat index loaded");
        self.store = Some(store);
        Ok(())
    }

    fn dim(&self) -> usize {
        self.store.as_ref().map_or(0, BinaryStore::dim)
    }

    fn size(&self) -> usize {
        self.store.as_ref().map_or(0, BinaryStore::size_bytes)
    }

    fn count(&self) -> usize {
        self.store.as_ref().map_or(0, BinaryStore::count)
    }

    fn index_type(&self) -> &str {
        "BIN_FLAT"
    }

    fn state(&self) -> IndexState {
        match &self.store {
            None => IndexState::Empty,
            Some(store) if store.count() == 0 => IndexState::Trained,
            Some(_) => IndexState::Built,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutorConfig;
    use crate::distance::MetricType;
    use crate::executor::QueryExecutor;
    use std::sync::Arc;

    fn ctx() -> IndexContext {
        IndexContext::new(Arc::new(
            QueryExecutor::new(ExecutorConfig::with_threads(4)).unwrap(),
        ))
    }

    fn grid(n: usize) -> Vec<f32> {
        (0..n).flat_map(|i| [i as f32, 0.0]).collect()
    }

    #[test]
    fn test_search_before_build() {
        let node = FlatIndexNode::new(ctx());
        let q = [0.0f32, 0.0];
        let ds = DataSet::from_f32(1, 2, &q).unwrap();
        assert!(matches!(
            node.search(&ds, &Config::default(), BitsetView::Empty),
            Err(AnnexError::EmptyIndex)
        ));
        assert_eq!(node.state(), IndexState::Empty);
    }

    #[test]
    fn test_build_and_search() {
        let data = grid(10);
        let ds = DataSet::from_f32(10, 2, &data).unwrap();
        let mut node = FlatIndexNode::new(ctx());
        node.build(&ds, &Config::default()).unwrap();
        assert_eq!(node.state(), IndexState::Built);
        assert_eq!(node.count(), 10);

        let q = [3.1f32, 0.0, 8.9, 0.0];
        let qs = DataSet::from_f32(2, 2, &q).unwrap();
        let res = node
            .search(&qs, &Config::default().with_k(2), BitsetView::Empty)
            .unwrap();
        assert_eq!(res.row_ids(0), &[3, 4]);
        assert_eq!(res.row_ids(1), &[9, 8]);
    }

    #[test]
    fn test_short_rows_padded() {
        let data = grid(3);
        let ds = DataSet::from_f32(3, 2, &data).unwrap();
        let mut node = FlatIndexNode::new(ctx());
        node.build(&ds, &Config::default()).unwrap();
        let res = node
            .search(&ds, &Config::default().with_k(5), BitsetView::Empty)
            .unwrap();
        assert_eq!(res.valid_in_row(0), 3);
        assert_eq!(&res.row_ids(0)[3..], &[-1, -1]);
        assert_eq!(res.row_distances(0)[4], f32::MAX);
    }

    #[test]
    fn test_train_replaces_previous_store() {
        let data = grid(4);
        let ds = DataSet::from_f32(4, 2, &data).unwrap();
        let mut node = FlatIndexNode::new(ctx());
        node.build(&ds, &Config::default()).unwrap();
        node.train(&ds, &Config::default()).unwrap();
        assert_eq!(node.count(), 0);
        assert_eq!(node.state(), IndexState::Trained);
    }

    #[test]
    fn test_add_dimension_mismatch_keeps_rows() {
        let data = grid(4);
        let ds = DataSet::from_f32(4, 2, &data).unwrap();
        let mut node = FlatIndexNode::new(ctx());
        node.build(&ds, &Config::default()).unwrap();

        let wide = [0.0f32; 3];
        let bad = DataSet::from_f32(1, 3, &wide).unwrap();
        assert!(node.add(&bad, &Config::default()).is_err());
        assert_eq!(node.count(), 4);
    }

    #[test]
    fn test_range_search_with_band() {
        let data = grid(10);
        let ds = DataSet::from_f32(10, 2, &data).unwrap();
        let mut node = FlatIndexNode::new(ctx());
        node.build(&ds, &Config::default()).unwrap();

        let q = [0.0f32, 0.0];
        let qs = DataSet::from_f32(1, 2, &q).unwrap();
        // squared L2: 0, 1, 4, 9, 16
        let cfg = Config::default().with_radius(10.0).with_range_filter(1.0);
        let res = node.range_search(&qs, &cfg, BitsetView::Empty).unwrap();
        assert_eq!(res.lims, vec![0, 3]);
        assert_eq!(res.ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_range_search_requires_radius() {
        let data = grid(2);
        let ds = DataSet::from_f32(2, 2, &data).unwrap();
        let mut node = FlatIndexNode::new(ctx());
        node.build(&ds, &Config::default()).unwrap();
        assert!(matches!(
            node.range_search(&ds, &Config::default(), BitsetView::Empty),
            Err(AnnexError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_get_vector_by_ids() {
        let data = grid(5);
        let ds = DataSet::from_f32(5, 2, &data).unwrap();
        let mut node = FlatIndexNode::new(ctx());
        node.build(&ds, &Config::default()).unwrap();

        let ids = [4i64, 1];
        let got = node.get_vector_by_ids(&DataSet::from_ids(&ids)).unwrap();
        assert_eq!(
            got,
            Vectors::Float {
                dim: 2,
                data: vec![4.0, 0.0, 1.0, 0.0]
            }
        );
        let missing = [7i64];
        assert!(matches!(
            node.get_vector_by_ids(&DataSet::from_ids(&missing)),
            Err(AnnexError::VectorNotFound(7))
        ));
    }

    #[test]
    fn test_serialize_requires_built() {
        let node = FlatIndexNode::new(ctx());
        let mut set = BinarySet::new();
        assert!(matches!(node.serialize(&mut set), Err(AnnexError::EmptyIndex)));
        assert!(set.is_empty());
    }

    #[test]
    fn test_deserialize_missing_blob() {
        let mut node = FlatIndexNode::new(ctx());
        assert!(matches!(
            node.deserialize(&BinarySet::new()),
            Err(AnnexError::BlobNotFound(_))
        ));
    }

    #[test]
    fn test_meta_not_implemented() {
        let node = FlatIndexNode::new(ctx());
        assert!(matches!(
            node.get_index_meta(&Config::default()),
            Err(AnnexError::NotImplemented(_))
        ));
    }

    #[test]
    fn test_binary_hamming_search() {
        let codes = [0b0000_0000u8, 0b0000_0001, 0b0000_0011, 0b1111_1111];
        let ds = DataSet::from_binary(4, 8, &codes).unwrap();
        let cfg = Config::default().with_metric("HAMMING").with_k(3);
        let mut node = BinaryFlatIndexNode::new(ctx());
        node.build(&ds, &cfg).unwrap();

        let q = [0u8];
        let qs = DataSet::from_binary(1, 8, &q).unwrap();
        let res = node.search(&qs, &cfg, BitsetView::Empty).unwrap();
        assert_eq!(res.row_ids(0), &[0, 1, 2]);
        assert_eq!(res.row_distances(0), &[0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_binary_rejects_float_metric() {
        let codes = [0u8; 2];
        let ds = DataSet::from_binary(2, 8, &codes).unwrap();
        let mut node = BinaryFlatIndexNode::new(ctx());
        assert!(matches!(
            node.build(&ds, &Config::default()),
            Err(AnnexError::InvalidMetric(_))
        ));
    }

    #[test]
    fn test_binary_serialize_round_trip() {
        let codes: Vec<u8> = (0..32).collect();
        let ds = DataSet::from_binary(16, 16, &codes).unwrap();
        let cfg = Config::default().with_metric("JACCARD");
        let mut node = BinaryFlatIndexNode::new(ctx());
        node.build(&ds, &cfg).unwrap();

        let mut set = BinarySet::new();
        node.serialize(&mut set).unwrap();
        assert!(set.contains(blob::BIN_FLAT));

        let mut loaded = BinaryFlatIndexNode::new(ctx());
        loaded.deserialize(&set).unwrap();
        assert_eq!(loaded.state(), IndexState::Built);
        assert_eq!(loaded.count(), 16);
        assert_eq!(loaded.dim(), 16);
    }

    #[test]
    fn test_deserialize_rejects_zero_dim_payload() {
        let data = grid(3);
        let ds = DataSet::from_f32(3, 2, &data).unwrap();
        let mut node = FlatIndexNode::new(ctx());
        node.build(&ds, &Config::default()).unwrap();

        // same field layout as a flat store: metric, dim, data
        let payload = bincode::serialize(&(MetricType::L2, 0usize, Vec::<f32>::new())).unwrap();
        let mut set = BinarySet::new();
        set.append(blob::FLAT, payload);

        assert!(matches!(node.deserialize(&set), Err(AnnexError::InvalidFormat(_))));
        assert_eq!(node.state(), IndexState::Built);
        assert_eq!(node.count(), 3);
    }

    #[test]
    fn test_binary_deserialize_rejects_zero_code_size() {
        let codes = [0u8, 1, 2, 3];
        let ds = DataSet::from_binary(2, 16, &codes).unwrap();
        let cfg = Config::default().with_metric("HAMMING");
        let mut node = BinaryFlatIndexNode::new(ctx());
        node.build(&ds, &cfg).unwrap();

        // metric, dim, code_size, codes
        let payload =
            bincode::serialize(&(MetricType::Hamming, 16usize, 0usize, vec![1u8, 2])).unwrap();
        let mut set = BinarySet::new();
        set.append(blob::BIN_FLAT, payload);

        assert!(matches!(node.deserialize(&set), Err(AnnexError::InvalidFormat(_))));
        assert_eq!(node.count(), 2);
    }
}
