//! Error types for annex operations.
//!
//! Every public operation returns either a value or exactly one
//! [`AnnexError`]; there are no partial results.

use std::io;
use thiserror::Error;

/// Result type alias using [`AnnexError`].
pub type Result<T> = std::result::Result<T, AnnexError>;

/// Errors that can occur while building, searching or persisting an index.
#[derive(Error, Debug)]
pub enum AnnexError {
    /// Operation on an index that holds no backend instance.
    #[error("empty index: build or deserialize before using the index")]
    EmptyIndex,

    /// Data was added to an index type that requires training first.
    #[error("index not trained: call train() before add()")]
    IndexNotTrained,

    /// Retraining an already trained device-resident index.
    #[error("index already trained: discard the index and construct a new one")]
    IndexAlreadyTrained,

    /// Every device slot is leased and the pool does not wait.
    #[error("resource exhausted: no free device slot")]
    ResourceExhausted,

    /// Waiting for a device slot exceeded the configured timeout.
    #[error("operation timed out")]
    Timeout,

    /// Native device failure (construction, allocation or transfer).
    #[error("device error: {0}")]
    DeviceError(String),

    /// The numeric backend failed inside a query or build task.
    #[error("backend compute error: {0}")]
    BackendCompute(String),

    /// An output buffer could not be allocated.
    #[error("allocation failure: could not reserve {requested} elements")]
    AllocationFailure {
        /// Number of elements requested.
        requested: usize,
    },

    /// The variant does not support this operation at all.
    #[error("operation not supported: {0}")]
    UnsupportedOperation(String),

    /// The operation exists in the contract but this variant leaves it out.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Invalid parameter value provided.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Unknown metric name, or a metric the variant cannot use.
    #[error("invalid metric: {0}")]
    InvalidMetric(String),

    /// Vector dimensions do not match the expected dimension.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Expected vector dimension.
        expected: usize,
        /// Actual vector dimension provided.
        actual: usize,
    },

    /// Vector with the specified ID was not found.
    #[error("vector not found: ID {0}")]
    VectorNotFound(i64),

    /// No blob with the given name in the container.
    #[error("blob not found: {0}")]
    BlobNotFound(String),

    /// No factory registered under the given index type name.
    #[error("unknown index type: {0}")]
    UnknownIndexType(String),

    /// I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Error during serialization or deserialization.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Checksum verification failed during loading.
    #[error("checksum mismatch: file may be corrupted")]
    ChecksumMismatch,

    /// Container has an invalid or unrecognized format.
    #[error("invalid format: {0}")]
    InvalidFormat(String),
}

impl AnnexError {
    /// Creates a new `DimensionMismatch` error.
    pub fn dimension_mismatch(expected: usize, actual: usize) -> Self {
        Self::DimensionMismatch { expected, actual }
    }

    /// Creates a new `InvalidParameter` error.
    pub fn invalid_parameter(msg: impl Into<String>) -> Self {
        Self::InvalidParameter(msg.into())
    }

    /// Creates a new `InvalidMetric` error.
    pub fn invalid_metric(msg: impl Into<String>) -> Self {
        Self::InvalidMetric(msg.into())
    }

    /// Creates a new `DeviceError`.
    pub fn device(msg: impl Into<String>) -> Self {
        Self::DeviceError(msg.into())
    }

    /// Creates a new `BackendCompute` error.
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::BackendCompute(msg.into())
    }

    /// Creates a new `UnsupportedOperation` error.
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::UnsupportedOperation(msg.into())
    }

    /// Creates a new `NotImplemented` error.
    pub fn not_implemented(msg: impl Into<String>) -> Self {
        Self::NotImplemented(msg.into())
    }

    /// Creates a new `InvalidFormat` error.
    pub fn invalid_format(msg: impl Into<String>) -> Self {
        Self::InvalidFormat(msg.into())
    }
}

impl From<bincode::Error> for AnnexError {
    fn from(err: bincode::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

impl From<serde_json::Error> for AnnexError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidParameter(err.to_string())
    }
}

impl From<rayon::ThreadPoolBuildError> for AnnexError {
    fn from(err: rayon::ThreadPoolBuildError) -> Self {
        Self::InvalidParameter(format!("thread pool: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AnnexError::dimension_mismatch(128, 256);
        assert_eq!(err.to_string(), "dimension mismatch: expected 128, got 256");

        let err = AnnexError::AllocationFailure { requested: 42 };
        assert_eq!(
            err.to_string(),
            "allocation failure: could not reserve 42 elements"
        );

        let err = AnnexError::Timeout;
        assert_eq!(err.to_string(), "operation timed out");

        let err = AnnexError::device("out of memory on device 0");
        assert_eq!(err.to_string(), "device error: out of memory on device 0");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: AnnexError = io_err.into();
        assert!(matches!(err, AnnexError::Io(_)));
    }

    #[test]
    fn test_error_from_json() {
        let err: AnnexError = serde_json::from_str::<u32>("not json").unwrap_err().into();
        assert!(matches!(err, AnnexError::InvalidParameter(_)));
    }
}
