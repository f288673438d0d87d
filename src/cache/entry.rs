//! Cache Entry Module
//!
//! Defines the structure for individual cache entries: an optional
//! in-memory value, an optional lazy stream producer, and a JSON meta
//! map. In multi-file mode the meta key `"file"` names the sidecar
//! holding the entry's value.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde_json::{Map, Value as JsonValue};
use tokio::io::AsyncRead;

use crate::cache::signal::Signal;
use crate::error::{Result, StoreError};

// == Well-Known Meta Keys ==
/// Meta key naming the sidecar's relative path once a value has been
/// externalized.
pub const META_FILE_KEY: &str = "file";

// == Closure Aliases ==
/// A fresh byte stream over an entry's value.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Future resolving to a fresh byte stream.
pub type ReaderFuture = Pin<Box<dyn Future<Output = Result<BoxedReader>> + Send>>;

/// Zero-argument factory yielding a fresh byte stream each call.
pub type ReaderFactory = Arc<dyn Fn() -> ReaderFuture + Send + Sync>;

/// User-supplied serializer for object values.
pub type SerializeFn = Arc<dyn Fn(&JsonValue) -> Result<Bytes> + Send + Sync>;

/// User-supplied deserializer attached to loaded entries.
pub type DeserializeFn = Arc<dyn Fn(&[u8]) -> Result<JsonValue> + Send + Sync>;

/// Predicate applied to each entry during load; rejected entries are
/// dropped from the loaded map.
pub type ValidateFn = Arc<dyn Fn(&str, &CacheEntry) -> bool + Send + Sync>;

/// Resolution payload of an in-flight sidecar write: the sidecar's
/// relative path on success.
pub(crate) type SidecarResult = std::result::Result<String, Arc<StoreError>>;

// == Value ==
/// An in-memory entry value.
#[derive(Debug, Clone)]
pub enum Value {
    /// Raw bytes, stored as-is
    Bytes(Bytes),
    /// A string, serialized as UTF-8
    Text(String),
    /// An arbitrary JSON value, requiring a configured serializer
    Object(JsonValue),
}

// == Deserialize State ==
/// Tri-state consumed by callers that lazily deserialize values. The
/// store records it but never interprets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeserializeState {
    /// No deserializer configured for this entry
    NotApplicable,
    /// A deserializer is attached but has not run yet
    Pending,
    /// The deserializer has produced its object
    Done,
}

/// Process-global entry identity, used to detect when a key has been
/// rebound to a newer entry while a sidecar write was in flight.
fn next_entry_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

// == Cache Entry ==
/// A single cache entry.
///
/// At any moment an entry that is about to be written out carries
/// either an in-memory [`Value`] or a reader factory. After sidecar
/// externalization the value is dropped and the reader is rebound to a
/// factory that streams the sidecar file.
#[derive(Clone)]
pub struct CacheEntry {
    pub(crate) id: u64,
    meta: Map<String, JsonValue>,
    value: Option<Value>,
    reader: Option<ReaderFactory>,
    /// Present iff a sidecar write is currently in flight for this entry.
    pub(crate) write_signal: Option<Signal<SidecarResult>>,
    /// Deserialization progress, preserved for consumers.
    pub deserialized: DeserializeState,
    pub(crate) deserialize: Option<DeserializeFn>,
}

impl CacheEntry {
    // == Constructor ==
    /// Creates an entry holding the given in-memory value.
    pub fn new(value: Value) -> Self {
        Self {
            id: next_entry_id(),
            meta: Map::new(),
            value: Some(value),
            reader: None,
            write_signal: None,
            deserialized: DeserializeState::NotApplicable,
            deserialize: None,
        }
    }

    /// Creates an entry with no value or reader yet; the loader fills
    /// one in from the decoded record.
    pub(crate) fn bare() -> Self {
        Self {
            id: next_entry_id(),
            meta: Map::new(),
            value: None,
            reader: None,
            write_signal: None,
            deserialized: DeserializeState::NotApplicable,
            deserialize: None,
        }
    }

    /// Creates an entry whose value is produced by a reader factory.
    ///
    /// The factory must yield a fresh stream on every call; a flush may
    /// drain it once to buffer the value, and sidecar writes stream it
    /// straight to disk.
    pub fn from_reader(reader: ReaderFactory) -> Self {
        Self {
            id: next_entry_id(),
            meta: Map::new(),
            value: None,
            reader: Some(reader),
            write_signal: None,
            deserialized: DeserializeState::NotApplicable,
            deserialize: None,
        }
    }

    /// Replaces the meta map.
    pub fn with_meta(mut self, meta: Map<String, JsonValue>) -> Self {
        self.meta = meta;
        self
    }

    // == Meta ==
    /// The entry's meta map.
    pub fn meta(&self) -> &Map<String, JsonValue> {
        &self.meta
    }

    /// Mutable access to the meta map.
    pub fn meta_mut(&mut self) -> &mut Map<String, JsonValue> {
        &mut self.meta
    }

    /// Meta serialized to JSON bytes, or `None` when the map is empty.
    pub(crate) fn meta_bytes(&self) -> Result<Option<Vec<u8>>> {
        if self.meta.is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::to_vec(&self.meta)?))
    }

    /// Relative sidecar path recorded in meta, if the value has been
    /// externalized.
    pub fn sidecar_path(&self) -> Option<&str> {
        self.meta.get(META_FILE_KEY).and_then(JsonValue::as_str)
    }

    // == Value Access ==
    /// The in-memory value, if still present.
    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    /// The value as raw bytes, when it is a bytes value.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self.value {
            Some(Value::Bytes(ref b)) => Some(b),
            _ => None,
        }
    }

    /// The value as text, when it is a text value.
    pub fn as_text(&self) -> Option<&str> {
        match self.value {
            Some(Value::Text(ref s)) => Some(s),
            _ => None,
        }
    }

    /// True if the entry carries a reader factory.
    pub fn has_reader(&self) -> bool {
        self.reader.is_some()
    }

    /// Opens a fresh stream over the entry's value via its reader
    /// factory, if one is attached.
    pub fn open_reader(&self) -> Option<ReaderFuture> {
        self.reader.as_ref().map(|factory| factory())
    }

    pub(crate) fn reader_factory(&self) -> Option<ReaderFactory> {
        self.reader.clone()
    }

    /// Materializes the in-memory value as bytes.
    ///
    /// Object values go through the configured serializer; `key` only
    /// feeds error messages.
    pub(crate) fn value_to_bytes(
        &self,
        key: &str,
        serialize: Option<&SerializeFn>,
    ) -> Result<Bytes> {
        match self.value {
            Some(Value::Bytes(ref b)) => Ok(b.clone()),
            Some(Value::Text(ref s)) => Ok(Bytes::copy_from_slice(s.as_bytes())),
            Some(Value::Object(ref obj)) => match serialize {
                Some(f) => f(obj),
                None => Err(StoreError::MissingSerializer(key.to_string())),
            },
            None => Err(StoreError::MissingValue(key.to_string())),
        }
    }

    // == Deserialize ==
    /// Runs the attached deserializer over the value bytes, marking the
    /// entry `Done`. Returns `None` when no deserializer is attached or
    /// no in-memory bytes are available.
    pub fn deserialize_value(&mut self) -> Result<Option<JsonValue>> {
        let f = match self.deserialize {
            Some(ref f) => Arc::clone(f),
            None => return Ok(None),
        };
        let bytes = match self.as_bytes() {
            Some(b) => b.clone(),
            None => return Ok(None),
        };
        let object = f(&bytes)?;
        self.deserialized = DeserializeState::Done;
        Ok(Some(object))
    }

    pub(crate) fn attach_deserialize(&mut self, f: DeserializeFn) {
        self.deserialize = Some(f);
        self.deserialized = DeserializeState::Pending;
    }

    // == Sidecar Publication ==
    /// Rebinds the entry onto its sidecar: records the relative path in
    /// meta, swaps the reader for the sidecar factory, and drops the
    /// buffered value.
    pub(crate) fn publish_sidecar(&mut self, rel: &str, reader: ReaderFactory) {
        self.meta
            .insert(META_FILE_KEY.to_string(), JsonValue::from(rel));
        self.reader = Some(reader);
        self.value = None;
        self.write_signal = None;
    }

    pub(crate) fn set_reader(&mut self, reader: ReaderFactory) {
        self.reader = Some(reader);
    }

    pub(crate) fn set_value(&mut self, value: Value) {
        self.value = Some(value);
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("meta", &self.meta)
            .field("value", &self.value)
            .field("has_reader", &self.reader.is_some())
            .field("write_in_flight", &self.write_signal.is_some())
            .field("deserialized", &self.deserialized)
            .finish()
    }
}

// == Conversions ==
impl From<Bytes> for CacheEntry {
    fn from(b: Bytes) -> Self {
        CacheEntry::new(Value::Bytes(b))
    }
}

impl From<Vec<u8>> for CacheEntry {
    fn from(v: Vec<u8>) -> Self {
        CacheEntry::new(Value::Bytes(Bytes::from(v)))
    }
}

impl From<&[u8]> for CacheEntry {
    fn from(v: &[u8]) -> Self {
        CacheEntry::new(Value::Bytes(Bytes::copy_from_slice(v)))
    }
}

impl From<String> for CacheEntry {
    fn from(s: String) -> Self {
        CacheEntry::new(Value::Text(s))
    }
}

impl From<&str> for CacheEntry {
    fn from(s: &str) -> Self {
        CacheEntry::new(Value::Text(s.to_string()))
    }
}

impl From<JsonValue> for CacheEntry {
    fn from(v: JsonValue) -> Self {
        CacheEntry::new(Value::Object(v))
    }
}
