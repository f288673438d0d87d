//! Cache Module
//!
//! Provides the persistent key/value cache store: the on-disk catalog
//! codec, the cold-start loader, the coalescing flusher, and the
//! sidecar manager for externalized values.

mod codec;
mod entry;
mod sidecar;
mod signal;
mod stats;
mod store;


// Re-export public types
pub use codec::{
    decode, encode_header, encode_record, Catalog, Mode, RawRecord, MAX_KEY_LEN, MAX_META_LEN,
    MAX_VALUE_LEN, VERSION,
};
pub use entry::{
    BoxedReader, CacheEntry, DeserializeFn, DeserializeState, ReaderFactory, ReaderFuture,
    SerializeFn, ValidateFn, Value, META_FILE_KEY,
};
pub use stats::StoreStats;
pub use store::CacheStore;
