//! Configuration Module
//!
//! Construction-time options for the cache store, loadable from
//! environment variables with sensible defaults.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::cache::{DeserializeFn, Mode, SerializeFn, ValidateFn};

/// Default coalescing window for deferred flushes.
const DEFAULT_FLUSH_DELAY_MS: u64 = 1000;

/// Cache store configuration.
///
/// Scalar values can be configured via environment variables with
/// sensible defaults; the closure hooks are attached through the
/// `with_*` builder methods.
#[derive(Clone)]
pub struct Config {
    /// Root directory for the catalog and sidecar files; created if missing
    pub dir: PathBuf,
    /// Coalescing window for deferred flushes. `None` disables flushing
    /// entirely; a zero duration flushes on the next timer tick.
    pub flush_delay: Option<Duration>,
    /// Inline values in the catalog (true) or externalize them to
    /// per-entry sidecar files (false)
    pub single_file: bool,
    /// Serializer for object values
    pub serialize: Option<SerializeFn>,
    /// Deserializer attached to loaded entries
    pub deserialize: Option<DeserializeFn>,
    /// Predicate applied per entry during load; rejected entries are dropped
    pub is_entry_valid: Option<ValidateFn>,
}

impl Config {
    /// Creates a Config with every option at its default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `CACHE_DIR` - Root directory (default: `.cache`)
    /// - `FLUSH_DELAY_MS` - Coalescing window in ms; negative disables
    ///   flushing (default: 1000)
    /// - `SINGLE_FILE` - Inline values in the catalog (default: true)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let flush_delay = match env::var("FLUSH_DELAY_MS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
        {
            Some(ms) if ms < 0 => None,
            Some(ms) => Some(Duration::from_millis(ms as u64)),
            None => defaults.flush_delay,
        };

        Self {
            dir: env::var("CACHE_DIR")
                .ok()
                .map(PathBuf::from)
                .unwrap_or(defaults.dir),
            flush_delay,
            single_file: env::var("SINGLE_FILE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.single_file),
            serialize: None,
            deserialize: None,
            is_entry_valid: None,
        }
    }

    // == Builder Methods ==
    /// Sets the root directory.
    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = dir.into();
        self
    }

    /// Sets the flush coalescing window; `None` disables flushing.
    pub fn with_flush_delay(mut self, delay: Option<Duration>) -> Self {
        self.flush_delay = delay;
        self
    }

    /// Selects inline (true) or sidecar (false) value storage.
    pub fn with_single_file(mut self, single_file: bool) -> Self {
        self.single_file = single_file;
        self
    }

    /// Attaches a serializer for object values.
    pub fn with_serialize(mut self, f: SerializeFn) -> Self {
        self.serialize = Some(f);
        self
    }

    /// Attaches a deserializer, applied lazily to loaded entries.
    pub fn with_deserialize(mut self, f: DeserializeFn) -> Self {
        self.deserialize = Some(f);
        self
    }

    /// Attaches a load-time validity predicate.
    pub fn with_is_entry_valid(mut self, f: ValidateFn) -> Self {
        self.is_entry_valid = Some(f);
        self
    }

    /// The storage mode implied by `single_file`.
    pub fn mode(&self) -> Mode {
        if self.single_file {
            Mode::SingleFile
        } else {
            Mode::MultiFile
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".cache"),
            flush_delay: Some(Duration::from_millis(DEFAULT_FLUSH_DELAY_MS)),
            single_file: true,
            serialize: None,
            deserialize: None,
            is_entry_valid: None,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("dir", &self.dir)
            .field("flush_delay", &self.flush_delay)
            .field("mode", &self.mode())
            .field("serialize", &self.serialize.is_some())
            .field("deserialize", &self.deserialize.is_some())
            .field("is_entry_valid", &self.is_entry_valid.is_some())
            .finish()
    }
}
