//! Configuration for index operations and for the shared runtime.
//!
//! [`Config`] carries per-call parameters (metric, `k`, radius, tuning
//! knobs). [`ExecutorConfig`] and [`DevicePoolConfig`] size the worker
//! pool and the device pool once, at startup.
//!
//! All three deserialize from JSON:
//!
//! ```
//! use annex::Config;
//!
//! let cfg = Config::from_json(r#"{"metric_type": "IP", "k": 5, "radius": 0.5}"#).unwrap();
//! assert_eq!(cfg.k, 5);
//! assert_eq!(cfg.radius, Some(0.5));
//! ```

use crate::constants;
use crate::distance::MetricType;
use crate::error::{AnnexError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-call parameters for build, search and range search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Metric name, e.g. `"L2"`, `"IP"`, `"HAMMING"`.
    pub metric_type: String,
    /// Neighbors per query for top-k search.
    pub k: usize,
    /// Range search threshold. Required for range search.
    pub radius: Option<f32>,
    /// Inner edge of the range search band. `None` disables the band.
    pub range_filter: Option<f32>,
    /// Number of inverted lists (IVF variants).
    pub nlist: usize,
    /// Number of lists scanned per query (IVF variants).
    pub nprobe: usize,
    /// Number of PQ subquantizers (IVF_PQ).
    pub m: usize,
    /// Bits per PQ code (IVF_PQ).
    pub nbits: usize,
    /// Cap on rows in flight for one search call.
    pub query_thread_num: Option<usize>,
    /// Nested parallelism allowed inside train/add.
    pub build_thread_num: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            metric_type: MetricType::L2.as_str().to_string(),
            k: 10,
            radius: None,
            range_filter: None,
            nlist: constants::ivf::DEFAULT_NLIST,
            nprobe: constants::ivf::DEFAULT_NPROBE,
            m: constants::ivf::DEFAULT_M,
            nbits: constants::ivf::DEFAULT_NBITS,
            query_thread_num: None,
            build_thread_num: None,
        }
    }
}

impl Config {
    /// Parse a config from a JSON object. Missing keys take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Set the metric by name.
    pub fn with_metric(mut self, metric: impl Into<String>) -> Self {
        self.metric_type = metric.into();
        self
    }

    /// Set `k`.
    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    /// Set the range search radius.
    pub fn with_radius(mut self, radius: f32) -> Self {
        self.radius = Some(radius);
        self
    }

    /// Set the range search band edge.
    pub fn with_range_filter(mut self, range_filter: f32) -> Self {
        self.range_filter = Some(range_filter);
        self
    }

    /// Set the number of inverted lists.
    pub fn with_nlist(mut self, nlist: usize) -> Self {
        self.nlist = nlist;
        self
    }

    /// Set the number of lists scanned per query.
    pub fn with_nprobe(mut self, nprobe: usize) -> Self {
        self.nprobe = nprobe;
        self
    }

    /// Set PQ subquantizers and code width.
    pub fn with_pq(mut self, m: usize, nbits: usize) -> Self {
        self.m = m;
        self.nbits = nbits;
        self
    }

    /// Cap the rows in flight for one search call.
    pub fn with_query_thread_num(mut self, n: usize) -> Self {
        self.query_thread_num = Some(n);
        self
    }

    /// Allow nested parallelism inside train/add.
    pub fn with_build_thread_num(mut self, n: usize) -> Self {
        self.build_thread_num = Some(n);
        self
    }

    /// Parsed metric.
    pub fn metric(&self) -> Result<MetricType> {
        self.metric_type.parse()
    }

    /// Band edge with the disabled sentinel substituted for `None`.
    pub fn range_filter_or_default(&self) -> f32 {
        self.range_filter
            .unwrap_or(constants::result::DEFAULT_RANGE_FILTER)
    }

    /// Checks the parameters a top-k search reads.
    pub fn validate_search(&self) -> Result<()> {
        if self.k == 0 {
            return Err(AnnexError::invalid_parameter("k must be greater than 0"));
        }
        if self.query_thread_num == Some(0) {
            return Err(AnnexError::invalid_parameter(
                "query_thread_num must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Checks the parameters a range search reads and returns
    /// `(radius, range_filter)` ready for the merger.
    pub fn validate_range_search(&self, metric: MetricType) -> Result<(f32, f32)> {
        let radius = self
            .radius
            .ok_or_else(|| AnnexError::invalid_parameter("radius is required for range search"))?;
        let range_filter = self.range_filter_or_default();
        crate::range::validate_range_params(metric, radius, range_filter)?;
        Ok((radius, range_filter))
    }

    /// Checks the parameters IVF training reads.
    pub fn validate_ivf(&self) -> Result<()> {
        if self.nlist == 0 {
            return Err(AnnexError::invalid_parameter("nlist must be greater than 0"));
        }
        self.validate_nprobe()
    }

    /// Checks `nprobe`, read by IVF training and search.
    pub fn validate_nprobe(&self) -> Result<()> {
        if self.nprobe == 0 {
            return Err(AnnexError::invalid_parameter("nprobe must be greater than 0"));
        }
        Ok(())
    }
}

/// Sizing of the shared query worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Worker threads. Fixed for the lifetime of the executor.
    pub num_threads: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            num_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}

impl ExecutorConfig {
    /// Executor with exactly `num_threads` workers.
    pub fn with_threads(num_threads: usize) -> Self {
        Self { num_threads }
    }
}

/// One compute device known to the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSpec {
    /// Device ordinal.
    pub id: u32,
    /// Device memory budget in bytes.
    pub memory_bytes: usize,
}

impl DeviceSpec {
    /// Device with the default memory budget.
    pub fn new(id: u32) -> Self {
        Self {
            id,
            memory_bytes: constants::device::DEFAULT_MEMORY_BYTES,
        }
    }

    /// Override the memory budget.
    pub fn with_memory_bytes(mut self, memory_bytes: usize) -> Self {
        self.memory_bytes = memory_bytes;
        self
    }
}

/// Devices owned by the lease pool and how long `acquire` may wait.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevicePoolConfig {
    /// One slot per entry.
    pub devices: Vec<DeviceSpec>,
    /// Maximum wait for a free slot. `0` fails immediately when saturated.
    pub acquire_timeout_ms: u64,
}

impl Default for DevicePoolConfig {
    fn default() -> Self {
        Self {
            devices: vec![DeviceSpec::new(0)],
            acquire_timeout_ms: constants::device::DEFAULT_ACQUIRE_TIMEOUT_MS,
        }
    }
}

impl DevicePoolConfig {
    /// `n` devices with ids `0..n` and default memory budgets.
    pub fn with_device_count(n: u32) -> Self {
        Self {
            devices: (0..n).map(DeviceSpec::new).collect(),
            ..Self::default()
        }
    }

    /// Override the acquire timeout.
    pub fn with_acquire_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.acquire_timeout_ms = timeout_ms;
        self
    }

    /// The acquire timeout as a Duration.
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_from_empty_json() {
        let cfg = Config::from_json("{}").unwrap();
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.metric().unwrap(), MetricType::L2);
        assert!(cfg.range_filter_or_default().is_infinite());
    }

    #[test]
    fn test_config_rejects_unknown_metric() {
        let cfg = Config::default().with_metric("MANHATTAN");
        assert!(matches!(cfg.metric(), Err(AnnexError::InvalidMetric(_))));
    }

    #[test]
    fn test_validate_search() {
        assert!(Config::default().with_k(0).validate_search().is_err());
        assert!(Config::default().with_k(3).validate_search().is_ok());
        assert!(Config::default()
            .with_query_thread_num(0)
            .validate_search()
            .is_err());
    }

    #[test]
    fn test_validate_range_search_requires_radius() {
        let err = Config::default()
            .validate_range_search(MetricType::L2)
            .unwrap_err();
        assert!(matches!(err, AnnexError::InvalidParameter(_)));

        let (radius, filter) = Config::default()
            .with_radius(2.0)
            .validate_range_search(MetricType::L2)
            .unwrap();
        assert_eq!(radius, 2.0);
        assert!(filter.is_infinite());
    }

    #[test]
    fn test_device_pool_config() {
        let cfg = DevicePoolConfig::with_device_count(3).with_acquire_timeout_ms(5);
        assert_eq!(cfg.devices.len(), 3);
        assert_eq!(cfg.devices[2].id, 2);
        assert_eq!(cfg.acquire_timeout(), Duration::from_millis(5));
    }

    #[test]
    fn test_device_pool_config_from_json() {
        let cfg: DevicePoolConfig = serde_json::from_str(
            r#"{"devices": [{"id": 1, "memory_bytes": 4096}], "acquire_timeout_ms": 0}"#,
        )
        .unwrap();
        assert_eq!(cfg.devices, vec![DeviceSpec::new(1).with_memory_bytes(4096)]);
        assert_eq!(cfg.acquire_timeout_ms, 0);
    }
}
