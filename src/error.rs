//! Error types for lycon.

use thiserror::Error;

use crate::network::Partition;

/// Result type alias for lycon operations.
pub type Result<T> = std::result::Result<T, NetworkError>;

/// Errors that can occur while building, applying or persisting a network.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum NetworkError {
    /// Invalid configuration parameter.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An explicit partition flag contradicts the pending weights.
    #[error("{partition} weights present: {in_weights}, but {partition} flag: {requested}")]
    PartitionMismatch {
        /// Partition whose flag disagrees
        partition: Partition,
        /// Whether the pending weights contain keys for the partition
        in_weights: bool,
        /// The flag passed by the caller
        requested: bool,
    },

    /// Neither flags nor pending weights decide which partitions to enable.
    #[error("partition flags must be set explicitly when no weights are loaded")]
    PartitionUnspecified,

    /// Two discovered adapters flatten to the same name.
    #[error("duplicated adapter name: {name}")]
    DuplicateName {
        /// The colliding name
        name: String,
    },

    /// The leaf layer has no shape-introspection rule.
    #[error("cannot adapt layer {name}: unsupported layer type {type_name}")]
    UnsupportedLayer {
        /// Adapter name that was requested
        name: String,
        /// Declared type of the host layer
        type_name: String,
    },

    /// The host dropped the layer an adapter wraps.
    #[error("base layer of adapter {name} no longer exists")]
    BaseLayerDropped {
        /// Adapter name
        name: String,
    },

    /// Shape mismatch in tensor operation.
    #[error("shape mismatch for {key}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Weight key
        key: String,
        /// Expected shape
        expected: Vec<usize>,
        /// Actual shape
        actual: Vec<usize>,
    },

    /// Weight loading error.
    #[error("failed to load weights: {0}")]
    WeightLoad(String),

    /// Filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Safetensors container error.
    #[error("safetensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Underlying candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}
