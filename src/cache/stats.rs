//! Cache Statistics Module
//!
//! Tracks store activity: lookup hits and misses, completed loads and
//! flushes, and the current entry count.

use serde::Serialize;

// == Store Stats ==
/// Store activity counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    /// Number of lookups that found an entry
    pub hits: u64,
    /// Number of lookups that found nothing
    pub misses: u64,
    /// Number of completed catalog loads
    pub loads: u64,
    /// Number of successfully committed flushes
    pub flushes: u64,
    /// Current number of entries in the live map
    pub total_entries: usize,
}

impl StoreStats {
    // == Constructor ==
    /// Creates a new StoreStats with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    // == Hit Rate ==
    /// Calculates the lookup hit rate.
    ///
    /// Returns hits / (hits + misses), or 0.0 if no lookups have been made.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    // == Record Hit ==
    /// Increments the hit counter.
    pub(crate) fn record_hit(&mut self) {
        self.hits += 1;
    }

    // == Record Miss ==
    /// Increments the miss counter.
    pub(crate) fn record_miss(&mut self) {
        self.misses += 1;
    }

    // == Record Load ==
    /// Increments the completed-load counter.
    pub(crate) fn record_load(&mut self) {
        self.loads += 1;
    }

    // == Record Flush ==
    /// Increments the committed-flush counter.
    pub(crate) fn record_flush(&mut self) {
        self.flushes += 1;
    }
}
