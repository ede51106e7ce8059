//! Named constants for configuration values.
//!
//! This module centralizes sentinels and default values used throughout
//! the codebase, making them easier to find, document, and tune.

/// Result sentinels.
pub mod result {
    /// Id written into top-k slots that have no hit.
    pub const SENTINEL_ID: i64 = -1;

    /// Range filter value meaning "band filtering disabled".
    pub const DEFAULT_RANGE_FILTER: f32 = f32::INFINITY;
}

/// Constants for device-resident inverted-file indexes.
pub mod ivf {
    /// Queries per block when a device index searches a batch.
    pub const GPU_SEARCH_BLOCK_SIZE: usize = 2048;

    /// Default number of inverted lists.
    pub const DEFAULT_NLIST: usize = 128;

    /// Default number of lists scanned per query.
    pub const DEFAULT_NPROBE: usize = 8;

    /// Default number of PQ subquantizers.
    pub const DEFAULT_M: usize = 4;

    /// Default bits per PQ code.
    pub const DEFAULT_NBITS: usize = 8;
}

/// Constants for k-means clustering.
pub mod kmeans {
    /// Threshold for switching from k-means++ to random initialization.
    /// k-means++ has O(k²n) complexity, which becomes expensive for large k.
    pub const KMEANSPP_THRESHOLD: usize = 64;

    /// Convergence threshold for early stopping.
    pub const CONVERGENCE_THRESHOLD: f32 = 0.001;

    /// Default number of iterations for coarse quantizer training.
    pub const DEFAULT_MAX_ITERATIONS: usize = 25;
}

/// Constants for the device lease pool.
pub mod device {
    /// Default time to wait for a free device slot.
    pub const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 30_000;

    /// Default device memory budget (1 GiB).
    pub const DEFAULT_MEMORY_BYTES: usize = 1024 * 1024 * 1024;
}

/// Names of serialized blobs inside a [`BinarySet`](crate::blob::BinarySet).
pub mod blob {
    /// Float flat index payload.
    pub const FLAT: &str = "FLAT";

    /// Binary flat index payload.
    pub const BIN_FLAT: &str = "BIN_FLAT";

    /// Inverted-file index payload (host form of a device index).
    pub const IVF: &str = "IVF";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinels() {
        assert_eq!(result::SENTINEL_ID, -1);
        assert!(result::DEFAULT_RANGE_FILTER.is_infinite());
    }

    #[test]
    fn test_block_size_nonzero() {
        assert!(ivf::GPU_SEARCH_BLOCK_SIZE > 0);
        assert_eq!(ivf::DEFAULT_NBITS, 8);
    }
}
