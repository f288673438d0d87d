//! Error types for the cache store
//!
//! Provides unified error handling using thiserror.

use std::sync::Arc;

use thiserror::Error;

// == Store Error Enum ==
/// Unified error type for cache store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Underlying filesystem failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Key failed boundary validation
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// A key, meta blob or value exceeds its frame bound
    #[error("{what} of {len} bytes exceeds the {max} byte limit")]
    TooLarge {
        /// What was being encoded ("key", "meta" or "value")
        what: &'static str,
        len: usize,
        max: usize,
    },

    /// An object value was supplied but no serializer is configured
    #[error("No serializer configured for object value of key: {0}")]
    MissingSerializer(String),

    /// User-supplied serializer failed
    #[error("Serialize failed: {0}")]
    Serialize(String),

    /// User-supplied deserializer failed
    #[error("Deserialize failed: {0}")]
    Deserialize(String),

    /// Entry carries neither a value nor a reader where one is required
    #[error("Entry for key {0} has neither value nor reader")]
    MissingValue(String),

    /// Entry meta could not be serialized to JSON
    #[error("Meta encoding failed: {0}")]
    MetaJson(#[from] serde_json::Error),

    /// A reader factory did not yield a stream
    #[error("Value reader failed: {0}")]
    Reader(String),

    /// An in-flight flush observed by this caller failed
    #[error("Flush failed: {0}")]
    FlushFailed(Arc<StoreError>),

    /// A sidecar write awaited by a flush failed
    #[error("Sidecar write failed: {0}")]
    SidecarWrite(Arc<StoreError>),
}

// == Result Type Alias ==
/// Convenience Result type for the cache store.
pub type Result<T> = std::result::Result<T, StoreError>;
