//! Device-resident inverted-file index nodes.
//!
//! The store lives on one device of the [`DevicePool`](crate::DevicePool)
//! and holds a reservation of that device's memory. Every operation that
//! touches the device leases it for the duration of the call:
//!
//! - `train` leases any free device and the index stays resident there
//! - `add`, `search` and `serialize` lease the resident device
//! - `deserialize` drops the old instance, then leases any free device
//!
//! Range search is unsupported on device; vector reconstruction and index
//! metadata are not implemented.

use super::node::{IndexContext, IndexNode, IndexState};
use super::{check_dim, empty_index};
use crate::backend::{alloc_search_result, write_row, IvfEncoding, IvfStore};
use crate::bitset::BitsetView;
use crate::blob::{BinarySet, FormatFlags};
use crate::config::Config;
use crate::constants::{blob, ivf::GPU_SEARCH_BLOCK_SIZE};
use crate::dataset::{DataSet, RangeSearchResult, SearchResult, Vectors};
use crate::device::{DeviceAllocation, Lease, WeakLease};
use crate::error::{AnnexError, Result};
use tracing::{debug, trace, warn};

/// Which code the inverted lists hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuIvfKind {
    /// Raw floats (`GPU_IVF_FLAT`).
    Flat,
    /// Product quantization (`GPU_IVF_PQ`).
    Pq,
    /// 8-bit scalar quantization (`GPU_IVF_SQ8`).
    Sq8,
}

impl GpuIvfKind {
    /// Registry name.
    pub fn name(&self) -> &'static str {
        match self {
            GpuIvfKind::Flat => "GPU_IVF_FLAT",
            GpuIvfKind::Pq => "GPU_IVF_PQ",
            GpuIvfKind::Sq8 => "GPU_IVF_SQ8",
        }
    }

    fn encoding(&self, config: &Config) -> IvfEncoding {
        match self {
            GpuIvfKind::Flat => IvfEncoding::Flat,
            GpuIvfKind::Pq => IvfEncoding::Pq {
                m: config.m,
                nbits: config.nbits,
            },
            GpuIvfKind::Sq8 => IvfEncoding::Sq8,
        }
    }

    fn matches(&self, encoding: IvfEncoding) -> bool {
        matches!(
            (self, encoding),
            (GpuIvfKind::Flat, IvfEncoding::Flat)
                | (GpuIvfKind::Pq, IvfEncoding::Pq { .. })
                | (GpuIvfKind::Sq8, IvfEncoding::Sq8)
        )
    }
}

/// A store uploaded to one device.
#[derive(Debug)]
struct Resident {
    store: IvfStore,
    device_id: u32,
    // one reservation per upload; freed when the resident copy is dropped
    allocations: Vec<DeviceAllocation>,
    last_lease: WeakLease,
}

/// Inverted-file index resident on a leased device.
#[derive(Debug)]
pub struct GpuIvfIndexNode {
    ctx: IndexContext,
    kind: GpuIvfKind,
    resident: Option<Resident>,
}

impl GpuIvfIndexNode {
    /// Create an empty node of the given kind.
    pub fn new(ctx: IndexContext, kind: GpuIvfKind) -> Self {
        Self {
            ctx,
            kind,
            resident: None,
        }
    }

    /// Device the index is resident on, if any.
    pub fn device_id(&self) -> Option<u32> {
        self.resident.as_ref().map(|r| r.device_id)
    }

    /// True while the lease of the most recent operation is still held.
    pub fn lease_active(&self) -> bool {
        self.resident
            .as_ref()
            .is_some_and(|r| r.last_lease.is_active())
    }

    fn lease_resident(&self, resident: &Resident) -> Result<Lease> {
        self.ctx
            .require_devices()?
            .acquire_device(resident.device_id)
            .inspect_err(|e| warn!(device = resident.device_id, error = %e, "device lease failed"))
    }

    fn lease_any(&self) -> Result<Lease> {
        self.ctx
            .require_devices()?
            .acquire()
            .inspect_err(|e| warn!(error = %e, "device lease failed"))
    }
}

impl IndexNode for GpuIvfIndexNode {
    fn train(&mut self, dataset: &DataSet<'_>, config: &Config) -> Result<()> {
        if self.resident.as_ref().is_some_and(|r| r.store.is_trained()) {
            warn!("index is already trained");
            return Err(AnnexError::IndexAlreadyTrained);
        }
        let metric = config.metric()?;
        config.validate_ivf()?;
        let rows = dataset.as_f32()?;

        let lease = self.lease_any()?;
        let mut store = IvfStore::new(metric, dataset.dim(), config.nlist, self.kind.encoding(config))?;
        self.ctx
            .executor
            .run_build(config.build_thread_num, || store.train(rows))
            .inspect_err(|e| warn!(error = %e, "device train failed"))?;
        let allocation = lease.device().allocate(store.size_bytes())?;

        debug!(
            kind = self.kind.name(),
            device = lease.device_id(),
            nlist = config.nlist,
            "index trained on device"
        );
        self.resident = Some(Resident {
            store,
            device_id: lease.device_id(),
            allocations: vec![allocation],
            last_lease: lease.downgrade(),
        });
        Ok(())
    }

    fn add(&mut self, dataset: &DataSet<'_>, config: &Config) -> Result<()> {
        let resident = self.resident.as_ref().ok_or(AnnexError::IndexNotTrained)?;
        check_dim(resident.store.dim(), dataset.dim())?;
        let rows = dataset.as_f32()?;
        let lease = self.lease_resident(resident)?;

        // reserve device memory before touching the lists
        let growth = resident.store.bytes_for_rows(dataset.rows());
        let allocation = lease.device().allocate(growth)?;

        let resident = self.resident.as_mut().ok_or(AnnexError::IndexNotTrained)?;
        let store = &mut resident.store;
        self.ctx
            .executor
            .run_build(config.build_thread_num, || store.add(rows))
            .inspect_err(|e| warn!(error = %e, "device add failed"))?;
        resident.allocations.push(allocation);
        resident.last_lease = lease.downgrade();
        debug!(added = dataset.rows(), total = resident.store.count(), "device add");
        Ok(())
    }

    fn search(
        &self,
        dataset: &DataSet<'_>,
        config: &Config,
        bitset: BitsetView<'_>,
    ) -> Result<SearchResult> {
        let resident = self.resident.as_ref().ok_or_else(|| empty_index("search"))?;
        config.validate_search()?;
        config.validate_nprobe()?;
        let queries = dataset.as_f32()?;
        let store = &resident.store;
        check_dim(store.dim(), dataset.dim())?;

        let _lease = self.lease_resident(resident)?;
        let nq = dataset.rows();
        let k = config.k;
        let dim = store.dim();
        let nprobe = config.nprobe;
        let worst = store.metric().worst_distance();
        let mut result = alloc_search_result(nq, k, worst)?;

        let block_span = GPU_SEARCH_BLOCK_SIZE * k;
        let blocks = result
            .ids
            .chunks_mut(block_span)
            .zip(result.distances.chunks_mut(block_span));
        for (b, (ids, distances)) in blocks.enumerate() {
            let base = b * GPU_SEARCH_BLOCK_SIZE;
            trace!(base, rows = ids.len() / k, "searching device block");
            self.ctx
                .executor
                .run_rows(k, ids, distances, config.query_thread_num, |j, ids, distances| {
                    let i = base + j;
                    let hits = store.search_row(&queries[i * dim..(i + 1) * dim], k, nprobe, bitset)?;
                    write_row(&hits, ids, distances, worst);
                    Ok(())
                })
                .inspect_err(|e| warn!(nq, error = %e, "device search failed"))?;
        }
        Ok(result)
    }

    fn range_search(
        &self,
        _dataset: &DataSet<'_>,
        _config: &Config,
        _bitset: BitsetView<'_>,
    ) -> Result<RangeSearchResult> {
        Err(AnnexError::unsupported(format!(
            "range search on {}",
            self.kind.name()
        )))
    }

    fn get_vector_by_ids(&self, _dataset: &DataSet<'_>) -> Result<Vectors> {
        Err(AnnexError::not_implemented(format!(
            "get_vector_by_ids on {}",
            self.kind.name()
        )))
    }

    fn get_index_meta(&self, _config: &Config) -> Result<serde_json::Value> {
        Err(AnnexError::not_implemented(format!(
            "index meta for {}",
            self.kind.name()
        )))
    }

    fn serialize(&self, binset: &mut BinarySet) -> Result<()> {
        if self.state() != IndexState::Built {
            return Err(empty_index("serialize"));
        }
        let resident = self.resident.as_ref().ok_or(AnnexError::EmptyIndex)?;
        let _lease = self.lease_resident(resident)?;

        let bytes = {
            let host = resident.store.clone();
            bincode::serialize(&host)?
        };
        binset.append(blob::IVF, bytes);
        binset.set_flag(FormatFlags::HAS_DEVICE_INDEX);
        Ok(())
    }

    fn deserialize(&mut self, binset: &BinarySet) -> Result<()> {
        let bytes = binset.get_by_name(blob::IVF)?;
        let store: IvfStore = bincode::deserialize(bytes.data())?;
        store
            .validate()
            .inspect_err(|e| warn!(error = %e, "rejected IVF payload"))?;
        if !store.is_trained() {
            return Err(AnnexError::invalid_format("IVF payload is not trained"));
        }
        if !self.kind.matches(store.encoding()) {
            return Err(AnnexError::invalid_format(format!(
                "{} payload cannot be loaded as {}",
                store.encoding().name(),
                self.kind.name()
            )));
        }

        if self.resident.take().is_some() {
            debug!("released previous device index");
        }
        let lease = self.lease_any()?;
        let allocation = lease.device().allocate(store.size_bytes())?;
        debug!(
            device = lease.device_id(),
            count = store.count(),
            "index uploaded to device"
        );
        self.resident = Some(Resident {
            store,
            device_id: lease.device_id(),
            allocations: vec![allocation],
            last_lease: lease.downgrade(),
        });
        Ok(())
    }

    fn dim(&self) -> usize {
        self.resident.as_ref().map_or(0, |r| r.store.dim())
    }

    fn size(&self) -> usize {
        self.resident.as_ref().map_or(0, |r| r.store.size_bytes())
    }

    fn count(&self) -> usize {
        self.resident.as_ref().map_or(0, |r| r.store.count())
    }

    fn index_type(&self) -> &str {
        self.kind.name()
    }

    fn state(&self) -> IndexState {
        match &self.resident {
            None => IndexState::Empty,
            Some(r) if r.store.count() == 0 => IndexState::Trained,
            Some(_) => IndexState::Built,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DevicePoolConfig, DeviceSpec, ExecutorConfig};
    use crate::device::DevicePool;
    use crate::distance::MetricType;
    use crate::executor::QueryExecutor;
    use rand::Rng;
    use std::sync::Arc;

    fn pool(devices: u32) -> DevicePool {
        DevicePool::new(DevicePoolConfig::with_device_count(devices).with_acquire_timeout_ms(0)).unwrap()
    }

    fn ctx(devices: &DevicePool) -> IndexContext {
        IndexContext::new(Arc::new(
            QueryExecutor::new(ExecutorConfig::with_threads(4)).unwrap(),
        ))
        .with_devices(devices.clone())
    }

    fn random_rows(n: usize, dim: usize) -> Vec<f32> {
        let mut rng = rand::thread_rng();
        (0..n * dim).map(|_| rng.gen_range(-1.0..1.0)).collect()
    }

    fn cfg() -> Config {
        Config::default().with_nlist(4).with_nprobe(4).with_k(5)
    }

    #[test]
    fn test_add_before_train() {
        let devices = pool(1);
        let mut node = GpuIvfIndexNode::new(ctx(&devices), GpuIvfKind::Flat);
        let data = random_rows(8, 4);
        let ds = DataSet::from_f32(8, 4, &data).unwrap();
        assert!(matches!(node.add(&ds, &cfg()), Err(AnnexError::IndexNotTrained)));
    }

    #[test]
    fn test_train_twice() {
        let devices = pool(1);
        let mut node = GpuIvfIndexNode::new(ctx(&devices), GpuIvfKind::Flat);
        let data = random_rows(64, 4);
        let ds = DataSet::from_f32(64, 4, &data).unwrap();
        node.train(&ds, &cfg()).unwrap();
        assert_eq!(node.state(), IndexState::Trained);
        assert!(matches!(node.train(&ds, &cfg()), Err(AnnexError::IndexAlreadyTrained)));
    }

    #[test]
    fn test_build_search_releases_lease() {
        let devices = pool(2);
        let mut node = GpuIvfIndexNode::new(ctx(&devices), GpuIvfKind::Flat);
        let data = random_rows(100, 8);
        let ds = DataSet::from_f32(100, 8, &data).unwrap();
        node.build(&ds, &cfg()).unwrap();
        assert_eq!(node.state(), IndexState::Built);
        assert_eq!(devices.available(), 2);
        assert!(!node.lease_active());

        let res = node.search(&ds, &cfg(), BitsetView::Empty).unwrap();
        assert_eq!(res.nq, 100);
        for i in 0..100 {
            assert_eq!(res.row_ids(i)[0], i as i64);
        }
        assert_eq!(devices.available(), 2);
    }

    #[test]
    fn test_search_fails_while_device_busy() {
        let devices = pool(1);
        let mut node = GpuIvfIndexNode::new(ctx(&devices), GpuIvfKind::Flat);
        let data = random_rows(32, 4);
        let ds = DataSet::from_f32(32, 4, &data).unwrap();
        node.build(&ds, &cfg()).unwrap();

        let held = devices.acquire().unwrap();
        assert!(matches!(
            node.search(&ds, &cfg(), BitsetView::Empty),
            Err(AnnexError::ResourceExhausted)
        ));
        drop(held);
        assert!(node.search(&ds, &cfg(), BitsetView::Empty).is_ok());
    }

    #[test]
    fn test_device_memory_exhausted() {
        let config = DevicePoolConfig {
            devices: vec![DeviceSpec::new(0).with_memory_bytes(64)],
            acquire_timeout_ms: 0,
        };
        let devices = DevicePool::new(config).unwrap();
        let mut node = GpuIvfIndexNode::new(ctx(&devices), GpuIvfKind::Flat);
        let data = random_rows(64, 8);
        let ds = DataSet::from_f32(64, 8, &data).unwrap();
        assert!(matches!(node.build(&ds, &cfg()), Err(AnnexError::DeviceError(_))));
        assert_eq!(node.state(), IndexState::Empty);
        assert_eq!(devices.available(), 1);
        assert_eq!(devices.device(0).unwrap().used_bytes(), 0);
    }

    #[test]
    fn test_failed_add_is_atomic() {
        let devices = pool(1);
        let mut node = GpuIvfIndexNode::new(ctx(&devices), GpuIvfKind::Sq8);
        let data = random_rows(64, 4);
        let ds = DataSet::from_f32(64, 4, &data).unwrap();
        node.build(&ds, &cfg()).unwrap();
        let used = devices.device(0).unwrap().used_bytes();

        let wide = random_rows(2, 5);
        let bad = DataSet::from_f32(2, 5, &wide).unwrap();
        assert!(node.add(&bad, &cfg()).is_err());
        assert_eq!(node.count(), 64);
        assert_eq!(devices.device(0).unwrap().used_bytes(), used);
    }

    #[test]
    fn test_unsupported_operations() {
        let devices = pool(1);
        let node = GpuIvfIndexNode::new(ctx(&devices), GpuIvfKind::Pq);
        let q = [0.0f32; 4];
        let ds = DataSet::from_f32(1, 4, &q).unwrap();
        assert!(matches!(
            node.range_search(&ds, &cfg().with_radius(1.0), BitsetView::Empty),
            Err(AnnexError::UnsupportedOperation(_))
        ));
        let ids = [0i64];
        assert!(matches!(
            node.get_vector_by_ids(&DataSet::from_ids(&ids)),
            Err(AnnexError::NotImplemented(_))
        ));
        assert!(matches!(
            node.get_index_meta(&cfg()),
            Err(AnnexError::NotImplemented(_))
        ));
    }

    #[test]
    fn test_serialize_round_trip() {
        let devices = pool(1);
        let mut node = GpuIvfIndexNode::new(ctx(&devices), GpuIvfKind::Flat);
        let data = random_rows(100, 8);
        let ds = DataSet::from_f32(100, 8, &data).unwrap();
        node.build(&ds, &cfg()).unwrap();

        let mut set = BinarySet::new();
        node.serialize(&mut set).unwrap();
        assert!(set.flags().has(FormatFlags::HAS_DEVICE_INDEX));

        let mut loaded = GpuIvfIndexNode::new(ctx(&devices), GpuIvfKind::Flat);
        loaded.deserialize(&set).unwrap();
        assert_eq!(loaded.state(), IndexState::Built);

        let a = node.search(&ds, &cfg(), BitsetView::Empty).unwrap();
        let b = loaded.search(&ds, &cfg(), BitsetView::Empty).unwrap();
        assert_eq!(a.ids, b.ids);
    }

    #[test]
    fn test_deserialize_rejects_other_kind() {
        let devices = pool(1);
        let mut node = GpuIvfIndexNode::new(ctx(&devices), GpuIvfKind::Flat);
        let data = random_rows(64, 4);
        let ds = DataSet::from_f32(64, 4, &data).unwrap();
        node.build(&ds, &cfg()).unwrap();
        let mut set = BinarySet::new();
        node.serialize(&mut set).unwrap();

        let mut other = GpuIvfIndexNode::new(ctx(&devices), GpuIvfKind::Sq8);
        assert!(matches!(other.deserialize(&set), Err(AnnexError::InvalidFormat(_))));
    }

    #[test]
    fn test_deserialize_releases_previous_instance() {
        let devices = pool(1);
        let data = random_rows(64, 4);
        let ds = DataSet::from_f32(64, 4, &data).unwrap();

        let mut node = GpuIvfIndexNode::new(ctx(&devices), GpuIvfKind::Flat);
        node.build(&ds, &cfg()).unwrap();
        let mut set = BinarySet::new();
        node.serialize(&mut set).unwrap();
        let one_copy = devices.device(0).unwrap().used_bytes();

        node.deserialize(&set).unwrap();
        assert_eq!(devices.device(0).unwrap().used_bytes(), one_copy);
    }

    #[test]
    fn test_deserialize_rejects_inconsistent_payload() {
        let devices = pool(1);
        let data = random_rows(64, 4);
        let ds = DataSet::from_f32(64, 4, &data).unwrap();
        let mut node = GpuIvfIndexNode::new(ctx(&devices), GpuIvfKind::Flat);
        node.build(&ds, &cfg()).unwrap();

        // metric, dim, nlist, encoding, no training, no lists, ntotal 5
        let payload = bincode::serialize(&(
            MetricType::L2,
            4usize,
            4usize,
            IvfEncoding::Flat,
            None::<()>,
            Vec::<()>::new(),
            5usize,
        ))
        .unwrap();
        let mut set = BinarySet::new();
        set.append(blob::IVF, payload);

        assert!(matches!(node.deserialize(&set), Err(AnnexError::InvalidFormat(_))));
        assert_eq!(node.state(), IndexState::Built);
        assert_eq!(node.count(), 64);
        assert!(node.search(&ds, &cfg(), BitsetView::Empty).is_ok());
    }

    #[test]
    fn test_search_rejects_zero_nprobe() {
        let devices = pool(1);
        let data = random_rows(64, 4);
        let ds = DataSet::from_f32(64, 4, &data).unwrap();
        let mut node = GpuIvfIndexNode::new(ctx(&devices), GpuIvfKind::Flat);
        node.build(&ds, &cfg()).unwrap();
        assert!(matches!(
            node.search(&ds, &cfg().with_nprobe(0), BitsetView::Empty),
            Err(AnnexError::InvalidParameter(_))
        ));
    }
}
