//! Cache Store Module
//!
//! The store facade tying four concerns into one consistent object:
//! the catalog codec, the one-shot cold-start loader, the deferred
//! coalescing flusher, and the sidecar manager. Mutations issued before
//! the first load completes are staged and drained into the live map at
//! load publication.
//!
//! A single mutex guards the store state and is never held across an
//! await; every cross-suspension handshake goes through a
//! [`Signal`](super::signal::Signal). At most one load and one flush
//! are ever in flight.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::codec::{self, Catalog, Mode};
use crate::cache::entry::{CacheEntry, SidecarResult, Value};
use crate::cache::sidecar::{self, Payload};
use crate::cache::signal::Signal;
use crate::cache::stats::StoreStats;
use crate::config::Config;
use crate::error::{Result, StoreError};

/// Name of the canonical catalog file under the store directory.
const CATALOG_FILE: &str = "cache";

/// Resolution payload of a flush signal, cloneable for every attached
/// waiter.
type FlushResult = std::result::Result<(), Arc<StoreError>>;

// == Staged Mutations ==
/// A mutation issued before the initial load completed. A removal is a
/// tagged tombstone, distinct from "key absent".
#[derive(Debug, Clone)]
enum Staged {
    Put(CacheEntry),
    Remove,
}

// == Store State ==
struct State {
    /// Live map; absent until the first load publishes it
    cache: Option<HashMap<String, CacheEntry>>,
    /// Mutations staged while the load is outstanding
    pending: HashMap<String, Staged>,
    /// In-flight load, if any
    load: Option<Signal<()>>,
    /// In-flight flush, if any
    flush: Option<Signal<FlushResult>>,
    /// Generation of the armed flush timer; bumping it cancels the timer
    timer_gen: u64,
    /// True iff the live map has mutations not yet committed to disk
    modified: bool,
    /// Latches a mutation observed while a flush was in progress
    write_after_flush: bool,
    stats: StoreStats,
}

impl State {
    fn new() -> Self {
        Self {
            cache: None,
            pending: HashMap::new(),
            load: None,
            flush: None,
            timer_gen: 0,
            modified: false,
            write_after_flush: false,
            stats: StoreStats::new(),
        }
    }

    /// Applies hit/miss accounting to a lookup outcome.
    fn record_lookup(&mut self, found: Option<CacheEntry>) -> Option<CacheEntry> {
        if found.is_some() {
            self.stats.record_hit();
        } else {
            self.stats.record_miss();
        }
        found
    }

    /// Looks up the live or staged entry a sidecar publication targets.
    fn entry_mut(&mut self, key: &str) -> Option<&mut CacheEntry> {
        if let Some(cache) = self.cache.as_mut() {
            cache.get_mut(key)
        } else {
            match self.pending.get_mut(key) {
                Some(Staged::Put(entry)) => Some(entry),
                _ => None,
            }
        }
    }
}

struct Inner {
    config: Config,
    dir: PathBuf,
    catalog_path: PathBuf,
    mode: Mode,
    state: Mutex<State>,
}

// == Cache Store ==
/// Persistent, in-memory-backed key/value cache store.
///
/// Contents live in memory and are durably mirrored to a catalog file
/// under the store directory. Bursts of mutations coalesce into a
/// single atomic catalog rewrite after the configured flush delay.
///
/// The handle is cheap to clone; all clones share one store. Operations
/// must run inside a tokio runtime.
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<Inner>,
}

impl CacheStore {
    // == Constructor ==
    /// Opens a store over `config.dir`, creating the directory if
    /// missing. The catalog is not read until the first operation needs
    /// it.
    pub fn new(config: Config) -> Result<Self> {
        let dir = config.dir.clone();
        std::fs::create_dir_all(&dir)?;
        let catalog_path = dir.join(CATALOG_FILE);
        let mode = config.mode();
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                dir,
                catalog_path,
                mode,
                state: Mutex::new(State::new()),
            }),
        })
    }

    /// The store's root directory.
    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Path of the canonical catalog file.
    pub fn catalog_path(&self) -> &Path {
        &self.inner.catalog_path
    }

    /// The value storage mode.
    pub fn mode(&self) -> Mode {
        self.inner.mode
    }

    // == Get ==
    /// Looks up an entry.
    ///
    /// Reads the live map when loaded, otherwise the staging area; a
    /// cold store triggers (or attaches to) the one-shot catalog load
    /// first. Never surfaces I/O errors: an unreadable catalog is an
    /// empty cache.
    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        {
            let mut state = self.inner.state.lock();
            let live = state.cache.as_ref().map(|cache| cache.get(key).cloned());
            if let Some(found) = live {
                return state.record_lookup(found);
            }
            let staged = state.pending.get(key).cloned();
            match staged {
                Some(Staged::Put(entry)) => return state.record_lookup(Some(entry)),
                Some(Staged::Remove) => return state.record_lookup(None),
                None => {}
            }
        }

        self.load().await;

        let mut state = self.inner.state.lock();
        let found = state
            .cache
            .as_ref()
            .and_then(|cache| cache.get(key))
            .cloned();
        state.record_lookup(found)
    }

    // == Put ==
    /// Inserts or replaces an entry.
    ///
    /// The new entry is observable through `get` immediately; the
    /// catalog rewrite is deferred and coalesced. In multi-file mode the
    /// sidecar write starts right away, even while the initial load is
    /// still outstanding. Keys must be non-empty and fit the catalog's
    /// 16-bit key frame; an object value without a configured serializer
    /// fails here.
    pub fn put(&self, key: impl Into<String>, entry: impl Into<CacheEntry>) -> Result<()> {
        let key = key.into();
        if key.is_empty() {
            return Err(StoreError::InvalidKey("key must not be empty".to_string()));
        }
        if key.len() > codec::MAX_KEY_LEN {
            return Err(StoreError::TooLarge {
                what: "key",
                len: key.len(),
                max: codec::MAX_KEY_LEN,
            });
        }

        let mut entry = entry.into();
        if let Some(f) = self.inner.config.deserialize.clone() {
            entry.attach_deserialize(f);
        }
        if self.inner.mode == Mode::MultiFile {
            self.begin_sidecar_write(&key, &mut entry)?;
        }

        let loaded = {
            let mut state = self.inner.state.lock();
            if let Some(cache) = state.cache.as_mut() {
                cache.insert(key, entry);
                state.modified = true;
                true
            } else {
                state.pending.insert(key, Staged::Put(entry));
                false
            }
        };

        if loaded {
            self.schedule_flush();
        } else {
            self.spawn_load();
        }
        Ok(())
    }

    // == Remove ==
    /// Removes an entry. Removing an absent key is a no-op with the
    /// same observable effect.
    ///
    /// In multi-file mode the entry's sidecar is unlinked in the
    /// background, after any in-flight write for it has settled.
    pub fn remove(&self, key: &str) {
        let (loaded, evicted) = {
            let mut state = self.inner.state.lock();
            if let Some(cache) = state.cache.as_mut() {
                let evicted = cache.remove(key);
                state.modified = true;
                (true, evicted)
            } else {
                state.pending.insert(key.to_string(), Staged::Remove);
                (false, None)
            }
        };

        if let Some(entry) = evicted {
            if self.inner.mode == Mode::MultiFile {
                let dir = self.inner.dir.clone();
                tokio::spawn(async move {
                    sidecar::remove_entry_file(&dir, &entry).await;
                });
            }
        }

        if loaded {
            self.schedule_flush();
        } else {
            self.spawn_load();
        }
    }

    // == Flush ==
    /// Commits the live map to disk.
    ///
    /// Returns once every mutation issued before this call is durable
    /// under the canonical catalog path. Attaches to an in-flight flush
    /// rather than starting a second one; a mutation racing an active
    /// flush is carried by the follow-up flush that the active one
    /// re-schedules. Flush failures restore the dirty flag so the next
    /// flush retries everything.
    pub async fn flush(&self) -> Result<()> {
        loop {
            // A cold store loads first, then re-enters.
            let cold = self.inner.state.lock().cache.is_none();
            if cold {
                self.load().await;
                continue;
            }

            enum Action {
                Done,
                Attach(Signal<FlushResult>),
                Reenter(Signal<FlushResult>),
                Run(Signal<FlushResult>, Vec<String>),
            }

            let action = {
                let mut state = self.inner.state.lock();
                // Cancel the armed timer; this call supersedes it.
                state.timer_gen += 1;
                if !state.modified {
                    match state.flush.clone() {
                        Some(signal) => Action::Attach(signal),
                        None => Action::Done,
                    }
                } else if let Some(signal) = state.flush.clone() {
                    Action::Reenter(signal)
                } else {
                    // From here on any new mutation re-dirties the map.
                    state.modified = false;
                    let signal = Signal::new();
                    state.flush = Some(signal.clone());
                    let keys = state
                        .cache
                        .as_ref()
                        .map(|cache| cache.keys().cloned().collect())
                        .unwrap_or_default();
                    Action::Run(signal, keys)
                }
            };

            match action {
                Action::Done => return Ok(()),
                Action::Attach(signal) => {
                    return signal.wait().await.map_err(StoreError::FlushFailed);
                }
                Action::Reenter(signal) => {
                    let _ = signal.wait().await;
                    continue;
                }
                Action::Run(signal, keys) => {
                    return self.run_flush(signal, keys).await;
                }
            }
        }
    }

    /// Executes one exclusive flush and settles its signal.
    async fn run_flush(&self, signal: Signal<FlushResult>, keys: Vec<String>) -> Result<()> {
        let result = self.write_catalog(keys).await;

        let reschedule = {
            let mut state = self.inner.state.lock();
            state.flush = None;
            match result {
                Ok(()) => state.stats.record_flush(),
                // A failed flush leaves the store dirty so the next
                // flush commits everything again.
                Err(_) => state.modified = true,
            }
            std::mem::take(&mut state.write_after_flush)
        };
        if reschedule {
            self.schedule_flush();
        }

        match result {
            Ok(()) => {
                signal.complete(Ok(()));
                Ok(())
            }
            Err(err) => {
                warn!("flush failed: {}", err);
                let err = Arc::new(err);
                signal.complete(Err(Arc::clone(&err)));
                Err(StoreError::FlushFailed(err))
            }
        }
    }

    // == Free ==
    /// Resets the store to its post-construction condition, waiting out
    /// any in-flight load and flush first. The on-disk catalog is
    /// untouched; the next read loads it afresh.
    pub async fn free(&self) {
        enum Waiter {
            Load(Signal<()>),
            Flush(Signal<FlushResult>),
        }

        loop {
            let waiter = {
                let mut state = self.inner.state.lock();
                if let Some(signal) = state.load.clone() {
                    Some(Waiter::Load(signal))
                } else if let Some(signal) = state.flush.clone() {
                    Some(Waiter::Flush(signal))
                } else {
                    state.timer_gen += 1;
                    state.cache = None;
                    state.pending.clear();
                    state.modified = false;
                    state.write_after_flush = false;
                    None
                }
            };

            match waiter {
                Some(Waiter::Load(signal)) => {
                    signal.wait().await;
                }
                Some(Waiter::Flush(signal)) => {
                    let _ = signal.wait().await;
                }
                None => return,
            }
        }
    }

    // == Stats ==
    /// Returns current store statistics.
    pub fn stats(&self) -> StoreStats {
        let state = self.inner.state.lock();
        let mut stats = state.stats.clone();
        stats.total_entries = state.cache.as_ref().map_or(0, HashMap::len);
        stats
    }

    // == Length ==
    /// Number of entries currently observable in memory (live map, or
    /// staged puts before the load completes).
    pub fn len(&self) -> usize {
        let state = self.inner.state.lock();
        match state.cache.as_ref() {
            Some(cache) => cache.len(),
            None => state
                .pending
                .values()
                .filter(|staged| matches!(staged, Staged::Put(_)))
                .count(),
        }
    }

    /// Returns true if no entries are observable in memory.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // == Loader ==
    fn spawn_load(&self) {
        let store = self.clone();
        tokio::spawn(async move {
            store.load().await;
        });
    }

    /// Runs the one-shot catalog load, or attaches to the one in
    /// flight. On completion the staged mutations are drained into the
    /// published map, latest mutation per key winning.
    pub(crate) async fn load(&self) {
        enum Action {
            Loaded,
            Attach(Signal<()>),
            Run(Signal<()>),
        }

        let action = {
            let mut state = self.inner.state.lock();
            if state.cache.is_some() {
                Action::Loaded
            } else if let Some(signal) = state.load.clone() {
                Action::Attach(signal)
            } else {
                let signal = Signal::new();
                state.load = Some(signal.clone());
                Action::Run(signal)
            }
        };

        let signal = match action {
            Action::Loaded => return,
            // Attach to the load already in flight.
            Action::Attach(signal) => return signal.wait().await,
            Action::Run(signal) => signal,
        };

        let mut map = self.read_catalog().await;

        let drained = {
            let mut state = self.inner.state.lock();
            let drained = !state.pending.is_empty();
            for (key, staged) in state.pending.drain() {
                match staged {
                    Staged::Put(entry) => {
                        map.insert(key, entry);
                    }
                    Staged::Remove => {
                        map.remove(&key);
                    }
                }
            }
            info!("cache loaded with {} entries", map.len());
            state.cache = Some(map);
            if drained {
                state.modified = true;
            }
            state.stats.record_load();
            state.load = None;
            drained
        };

        if drained {
            self.schedule_flush();
        }
        signal.complete(());
    }

    /// Reads and decodes the catalog into a fresh map.
    ///
    /// Never fails: a missing or unreadable file, a version mismatch,
    /// and a malformed tail all yield an empty or partial map. Entries
    /// rejected by the configured validity predicate are dropped.
    async fn read_catalog(&self) -> HashMap<String, CacheEntry> {
        let mut map = HashMap::new();

        let data = match tokio::fs::read(&self.inner.catalog_path).await {
            Ok(data) => data,
            Err(err) => {
                debug!("catalog not readable ({}); starting cold", err);
                return map;
            }
        };

        let records = match codec::decode(codec::VERSION, &data) {
            Catalog::VersionMismatch => {
                info!("catalog version mismatch; treating cache as empty");
                return map;
            }
            Catalog::Records(records) => records,
        };

        for record in records {
            let mut entry = CacheEntry::bare();
            if let Some(meta_bytes) = record.meta {
                match serde_json::from_slice::<JsonValue>(&meta_bytes) {
                    Ok(JsonValue::Object(meta)) => *entry.meta_mut() = meta,
                    // Meta that fails to parse ends the load at the
                    // furthest healthy record, like a stream error.
                    _ => {
                        warn!("malformed meta for key {}; load stops here", record.key);
                        break;
                    }
                }
            }

            // The predicate judges the bare entry (meta only); the
            // value or sidecar reader is attached after it passes.
            if let Some(valid) = self.inner.config.is_entry_valid.as_ref() {
                if !valid(&record.key, &entry) {
                    debug!("entry {} rejected by validity predicate", record.key);
                    continue;
                }
            }

            if let Some(value) = record.value {
                entry.set_value(Value::Bytes(value));
            } else if let Some(rel) = entry.sidecar_path() {
                let path = self.inner.dir.join(rel);
                entry.set_reader(sidecar::sidecar_reader(path, None));
            }

            if let Some(f) = self.inner.config.deserialize.clone() {
                entry.attach_deserialize(f);
            }
            map.insert(record.key, entry);
        }
        map
    }

    // == Flush Scheduling ==
    /// Arms (or re-arms) the deferred flush after a mutation. With a
    /// flush in progress the mutation is latched instead; the active
    /// flush re-schedules on completion. Re-arming supersedes the
    /// previous timer, so a burst of mutations produces one flush.
    fn schedule_flush(&self) {
        let delay = match self.inner.config.flush_delay {
            Some(delay) => delay,
            // Flushing disabled entirely.
            None => return,
        };

        let generation = {
            let mut state = self.inner.state.lock();
            if state.flush.is_some() {
                state.write_after_flush = true;
                return;
            }
            state.timer_gen += 1;
            state.timer_gen
        };
        crate::tasks::spawn_flush_timer(self.clone(), delay, generation);
    }

    /// True while the timer armed with `generation` is still current.
    pub(crate) fn timer_current(&self, generation: u64) -> bool {
        self.inner.state.lock().timer_gen == generation
    }

    // == Catalog Writing ==
    /// Serializes the live map to a transient file and swaps it into
    /// the canonical path. The transient file is unlinked on failure.
    async fn write_catalog(&self, keys: Vec<String>) -> Result<()> {
        let tmp_path = self
            .inner
            .dir
            .join(format!("tmp{}", Uuid::new_v4().simple()));
        let result = self.commit_catalog(&tmp_path, &keys).await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(&tmp_path).await;
        }
        result
    }

    async fn commit_catalog(&self, tmp_path: &Path, keys: &[String]) -> Result<()> {
        let file = tokio::fs::File::create(tmp_path).await?;
        let mut writer = BufWriter::new(file);
        writer
            .write_all(&codec::encode_header(codec::VERSION, self.inner.mode))
            .await?;

        let mut written = 0usize;
        for key in keys {
            // The key may have been removed while this flush was
            // suspended on I/O.
            let Some(mut entry) = self.lookup_entry(key) else {
                continue;
            };

            if self.inner.mode == Mode::MultiFile {
                if let Some(signal) = entry.write_signal.clone() {
                    // No record enters the catalog until its sidecar
                    // write has completed successfully.
                    if let Err(err) = signal.wait().await {
                        return Err(StoreError::SidecarWrite(err));
                    }
                    match self.lookup_entry(key) {
                        Some(published) => entry = published,
                        None => continue,
                    }
                }
            }

            let meta = entry.meta_bytes()?;
            let value = match self.inner.mode {
                Mode::SingleFile => Some(self.materialize_value(key, &entry).await?),
                Mode::MultiFile => None,
            };

            let mut frame = BytesMut::new();
            codec::encode_record(&mut frame, key, meta.as_deref(), value.as_deref())?;
            writer.write_all(&frame).await?;
            written += 1;
        }

        writer.flush().await?;
        writer.into_inner().sync_all().await?;

        // Swap the new catalog in; absence of the old one is fine.
        match tokio::fs::remove_file(&self.inner.catalog_path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        tokio::fs::rename(tmp_path, &self.inner.catalog_path).await?;
        debug!("catalog committed with {} records", written);
        Ok(())
    }

    fn lookup_entry(&self, key: &str) -> Option<CacheEntry> {
        self.inner
            .state
            .lock()
            .cache
            .as_ref()
            .and_then(|cache| cache.get(key))
            .cloned()
    }

    /// Materializes an entry's bytes for an inline catalog record. An
    /// entry holding only a reader is drained fully into memory, once.
    async fn materialize_value(&self, key: &str, entry: &CacheEntry) -> Result<Bytes> {
        if entry.value().is_some() {
            return entry.value_to_bytes(key, self.inner.config.serialize.as_ref());
        }
        if let Some(open) = entry.open_reader() {
            let mut reader = open.await?;
            let mut buffered = Vec::new();
            reader.read_to_end(&mut buffered).await?;
            return Ok(Bytes::from(buffered));
        }
        Err(StoreError::MissingValue(key.to_string()))
    }

    // == Sidecar Writes ==
    /// Starts the background sidecar write for a new entry's value.
    ///
    /// No-op when the entry already names a sidecar or has a write in
    /// flight. Publication rebinds the entry onto the sidecar, unless
    /// the key has been rebound to a newer entry in the meantime (the
    /// written file then stays behind as a tolerated orphan).
    fn begin_sidecar_write(&self, key: &str, entry: &mut CacheEntry) -> Result<()> {
        if entry.sidecar_path().is_some() || entry.write_signal.is_some() {
            return Ok(());
        }

        let payload = if entry.value().is_some() {
            Payload::Bytes(entry.value_to_bytes(key, self.inner.config.serialize.as_ref())?)
        } else if let Some(factory) = entry.reader_factory() {
            Payload::Reader(factory)
        } else {
            return Err(StoreError::MissingValue(key.to_string()));
        };

        let signal: Signal<SidecarResult> = Signal::new();
        entry.write_signal = Some(signal.clone());

        let store = self.clone();
        let key = key.to_string();
        let id = entry.id;
        tokio::spawn(async move {
            let rel = sidecar::alloc_rel_path();
            let path = store.inner.dir.join(&rel);
            match sidecar::write_value(&path, payload).await {
                Ok(()) => {
                    {
                        let mut state = store.inner.state.lock();
                        if let Some(current) = state.entry_mut(&key) {
                            if current.id == id {
                                let reader =
                                    sidecar::sidecar_reader(path, Some(signal.clone()));
                                current.publish_sidecar(&rel, reader);
                            }
                        }
                    }
                    debug!("sidecar written for {} at {}", key, rel);
                    signal.complete(Ok(rel));
                }
                Err(err) => {
                    warn!("sidecar write failed for {}: {}", key, err);
                    signal.complete(Err(Arc::new(err)));
                }
            }
        });
        Ok(())
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("CacheStore")
            .field("dir", &self.inner.dir)
            .field("mode", &self.inner.mode)
            .field("loaded", &state.cache.is_some())
            .field("pending", &state.pending.len())
            .field("modified", &state.modified)
            .finish()
    }
}
