//! Integration Tests for the Cache Store
//!
//! Exercises full store lifecycles against real directories: cold
//! reads, write-and-recover, flush coalescing, pending-mutation
//! draining, multi-file externalization, and version migration.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cachefile::cache::{decode, BoxedReader, Catalog, RawRecord, ReaderFactory, VERSION};
use cachefile::{CacheEntry, CacheStore, Config, StoreError};
use tokio::io::AsyncReadExt;

// == Helper Functions ==

/// Routes store logs through the test harness; safe to call repeatedly.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A store with deferred flushing disabled; every commit is explicit.
fn manual_store(dir: &Path) -> CacheStore {
    init_logging();
    CacheStore::new(Config::new().with_dir(dir).with_flush_delay(None)).unwrap()
}

/// Same, in multi-file mode.
fn multi_file_store(dir: &Path) -> CacheStore {
    init_logging();
    CacheStore::new(
        Config::new()
            .with_dir(dir)
            .with_flush_delay(None)
            .with_single_file(false),
    )
    .unwrap()
}

/// Decodes the on-disk catalog, panicking on a version mismatch.
fn read_catalog_records(store: &CacheStore) -> Vec<RawRecord> {
    let data = std::fs::read(store.catalog_path()).unwrap();
    match decode(VERSION, &data) {
        Catalog::Records(records) => records,
        Catalog::VersionMismatch => panic!("unexpected catalog version"),
    }
}

/// Drains an entry's reader stream into memory.
async fn read_entry_stream(entry: &CacheEntry) -> Vec<u8> {
    let mut reader = entry.open_reader().expect("entry has a reader").await.unwrap();
    let mut content = Vec::new();
    reader.read_to_end(&mut content).await.unwrap();
    content
}

// == Cold Start ==

#[tokio::test]
async fn test_cold_read_on_empty_dir() {
    let dir = tempfile::tempdir().unwrap();
    let store = manual_store(dir.path());

    assert!(store.get("a").await.is_none());
    // A read alone must not create a catalog
    assert!(!store.catalog_path().exists());
}

// == Write And Recover ==

#[tokio::test]
async fn test_write_and_recover_single_file() {
    let dir = tempfile::tempdir().unwrap();
    let store = manual_store(dir.path());

    store.put("x", b"hi".as_slice()).unwrap();
    store.flush().await.unwrap();

    // version=1 mode=1 keyLen=1 "x" metaLen=0 valueLen=2 "hi"
    let on_disk = std::fs::read(store.catalog_path()).unwrap();
    assert_eq!(
        on_disk,
        [0x01, 0x01, 0x01, 0x00, 0x78, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x68, 0x69]
    );

    let reopened = manual_store(dir.path());
    let entry = reopened.get("x").await.unwrap();
    assert_eq!(entry.as_bytes().unwrap().as_ref(), b"hi");
}

#[tokio::test]
async fn test_recover_preserves_meta() {
    let dir = tempfile::tempdir().unwrap();
    let store = manual_store(dir.path());

    let mut entry = CacheEntry::from("value");
    entry
        .meta_mut()
        .insert("label".to_string(), serde_json::json!("alpha"));
    store.put("k", entry).unwrap();
    store.flush().await.unwrap();

    let reopened = manual_store(dir.path());
    let entry = reopened.get("k").await.unwrap();
    assert_eq!(entry.meta()["label"], "alpha");
    assert_eq!(entry.as_bytes().unwrap().as_ref(), b"value");
}

// == Flush Coalescing ==

#[tokio::test]
async fn test_mutation_burst_coalesces_into_one_flush() {
    let dir = tempfile::tempdir().unwrap();
    let store = CacheStore::new(
        Config::new()
            .with_dir(dir.path())
            .with_flush_delay(Some(Duration::from_millis(50))),
    )
    .unwrap();

    store.put("a", "1").unwrap();
    store.put("b", "2").unwrap();
    store.put("c", "3").unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;

    assert_eq!(store.stats().flushes, 1);
    assert_eq!(read_catalog_records(&store).len(), 3);

    // No transient flush files survive
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("tmp"))
        .collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn test_mutation_during_flush_is_committed_eventually() {
    let dir = tempfile::tempdir().unwrap();
    let store = manual_store(dir.path());

    store.put("a", "1").unwrap();
    let flushing = tokio::spawn({
        let store = store.clone();
        async move { store.flush().await.unwrap() }
    });
    tokio::task::yield_now().await;
    store.put("b", "2").unwrap();
    flushing.await.unwrap();
    store.flush().await.unwrap();

    let reopened = manual_store(dir.path());
    assert_eq!(reopened.get("a").await.unwrap().as_bytes().unwrap().as_ref(), b"1");
    assert_eq!(reopened.get("b").await.unwrap().as_bytes().unwrap().as_ref(), b"2");
}

// == Pending Drain ==

#[tokio::test]
async fn test_mutations_staged_before_load_drain_latest_wins() {
    let dir = tempfile::tempdir().unwrap();
    let store = manual_store(dir.path());

    // Issued back to back, before the background load can run
    store.put("a", "1").unwrap();
    store.remove("a");
    store.put("b", "2").unwrap();

    // Forces the load, the drain, and the commit
    store.flush().await.unwrap();

    assert!(store.get("a").await.is_none());
    assert_eq!(store.get("b").await.unwrap().as_text(), Some("2"));
    assert_eq!(store.len(), 1);

    let reopened = manual_store(dir.path());
    assert!(reopened.get("a").await.is_none());
    assert_eq!(reopened.get("b").await.unwrap().as_bytes().unwrap().as_ref(), b"2");
}

#[tokio::test]
async fn test_staged_remove_hides_persisted_entry() {
    let dir = tempfile::tempdir().unwrap();
    let store = manual_store(dir.path());
    store.put("k", "old").unwrap();
    store.flush().await.unwrap();

    // Fresh store over the same dir; remove lands before the load
    let reopened = manual_store(dir.path());
    reopened.remove("k");
    assert!(reopened.get("k").await.is_none());
}

// == Multi-File Externalization ==

#[tokio::test]
async fn test_multi_file_externalizes_value_to_sidecar() {
    let dir = tempfile::tempdir().unwrap();
    let store = multi_file_store(dir.path());

    store.put("k", b"payload".as_slice()).unwrap();
    store.flush().await.unwrap();

    let records = read_catalog_records(&store);
    assert_eq!(records.len(), 1);
    assert!(records[0].value.is_none());

    let meta: serde_json::Value =
        serde_json::from_slice(records[0].meta.as_ref().unwrap()).unwrap();
    let rel = meta["file"].as_str().unwrap();
    // Two-level fan-out: two hex chars, then the rest
    assert_eq!(rel.as_bytes()[2], b'/');

    let sidecar = dir.path().join(rel);
    assert_eq!(std::fs::read(&sidecar).unwrap(), b"payload");

    // The published entry streams the sidecar back
    let entry = store.get("k").await.unwrap();
    assert!(entry.value().is_none());
    assert_eq!(entry.sidecar_path(), Some(rel));
    assert_eq!(read_entry_stream(&entry).await, b"payload");
}

#[tokio::test]
async fn test_multi_file_remove_unlinks_sidecar() {
    let dir = tempfile::tempdir().unwrap();
    let store = multi_file_store(dir.path());

    store.put("k", b"payload".as_slice()).unwrap();
    store.flush().await.unwrap();
    let records = read_catalog_records(&store);
    let meta: serde_json::Value =
        serde_json::from_slice(records[0].meta.as_ref().unwrap()).unwrap();
    let sidecar = dir.path().join(meta["file"].as_str().unwrap());
    assert!(sidecar.exists());

    store.remove("k");
    store.flush().await.unwrap();
    // The unlink runs in the background
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!sidecar.exists());
    assert!(read_catalog_records(&store).is_empty());
}

#[tokio::test]
async fn test_multi_file_recovery_streams_sidecar() {
    let dir = tempfile::tempdir().unwrap();
    let store = multi_file_store(dir.path());
    store.put("k", b"persisted bytes".as_slice()).unwrap();
    store.flush().await.unwrap();

    let reopened = multi_file_store(dir.path());
    let entry = reopened.get("k").await.unwrap();
    assert_eq!(read_entry_stream(&entry).await, b"persisted bytes");
}

#[tokio::test]
async fn test_multi_file_streams_reader_entry() {
    let dir = tempfile::tempdir().unwrap();
    let store = multi_file_store(dir.path());

    let factory: ReaderFactory = Arc::new(|| {
        Box::pin(async {
            Ok(Box::new(std::io::Cursor::new(b"from a stream".to_vec())) as BoxedReader)
        })
    });
    store.put("s", CacheEntry::from_reader(factory)).unwrap();
    store.flush().await.unwrap();

    let reopened = multi_file_store(dir.path());
    let entry = reopened.get("s").await.unwrap();
    assert_eq!(read_entry_stream(&entry).await, b"from a stream");
}

// == Version Migration ==

#[tokio::test]
async fn test_version_mismatch_loads_empty_then_rewrites() {
    let dir = tempfile::tempdir().unwrap();
    // A catalog written by version 0 of the format
    std::fs::write(
        dir.path().join("cache"),
        [0x00, 0x01, 0x01, 0x00, 0x78, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x68, 0x69],
    )
    .unwrap();

    let store = manual_store(dir.path());
    assert!(store.get("x").await.is_none());

    store.put("fresh", "value").unwrap();
    store.flush().await.unwrap();

    let on_disk = std::fs::read(store.catalog_path()).unwrap();
    assert_eq!(on_disk[0], VERSION);

    let reopened = manual_store(dir.path());
    let entry = reopened.get("fresh").await.unwrap();
    assert_eq!(entry.as_bytes().unwrap().as_ref(), b"value");
}

// == Free ==

#[tokio::test]
async fn test_free_reload_matches_process_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store = manual_store(dir.path());
    store.put("k", "v").unwrap();
    store.flush().await.unwrap();

    store.free().await;
    let after_free = store.get("k").await.unwrap();

    let restarted = manual_store(dir.path());
    let after_restart = restarted.get("k").await.unwrap();

    // Both paths reload from disk and observe the same bytes
    assert_eq!(after_free.as_bytes().unwrap(), after_restart.as_bytes().unwrap());
    assert_eq!(after_free.as_bytes().unwrap().as_ref(), b"v");
}

// == Serialization Hooks ==

#[tokio::test]
async fn test_object_value_roundtrip_through_serializer() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::new()
        .with_dir(dir.path())
        .with_flush_delay(None)
        .with_serialize(Arc::new(|value| {
            Ok(Bytes::from(serde_json::to_vec(value).unwrap()))
        }))
        .with_deserialize(Arc::new(|bytes| {
            serde_json::from_slice(bytes).map_err(StoreError::MetaJson)
        }));

    let store = CacheStore::new(config.clone()).unwrap();
    store
        .put("obj", serde_json::json!({"answer": 42}))
        .unwrap();
    store.flush().await.unwrap();

    let reopened = CacheStore::new(config).unwrap();
    let mut entry = reopened.get("obj").await.unwrap();
    let object = entry.deserialize_value().unwrap().unwrap();
    assert_eq!(object["answer"], 42);
}

#[tokio::test]
async fn test_object_without_serializer_fails_at_put_in_multi_file() {
    let dir = tempfile::tempdir().unwrap();
    let store = multi_file_store(dir.path());

    let err = store.put("o", serde_json::json!({"a": 1})).unwrap_err();
    assert!(matches!(err, StoreError::MissingSerializer(_)));
}

#[tokio::test]
async fn test_object_without_serializer_fails_at_flush_in_single_file() {
    let dir = tempfile::tempdir().unwrap();
    let store = manual_store(dir.path());

    store.put("o", serde_json::json!({"a": 1})).unwrap();
    let err = store.flush().await.unwrap_err();
    assert!(matches!(err, StoreError::FlushFailed(_)));

    // The store stays dirty, so fixing the entry lets a retry commit
    store.put("o", "plain").unwrap();
    store.flush().await.unwrap();
    let reopened = manual_store(dir.path());
    let entry = reopened.get("o").await.unwrap();
    assert_eq!(entry.as_bytes().unwrap().as_ref(), b"plain");
}

#[tokio::test]
async fn test_reader_entry_inlined_in_single_file_catalog() {
    let dir = tempfile::tempdir().unwrap();
    let store = manual_store(dir.path());

    let factory: ReaderFactory = Arc::new(|| {
        Box::pin(async {
            Ok(Box::new(std::io::Cursor::new(b"drained once".to_vec())) as BoxedReader)
        })
    });
    store.put("r", CacheEntry::from_reader(factory)).unwrap();
    store.flush().await.unwrap();

    let reopened = manual_store(dir.path());
    let entry = reopened.get("r").await.unwrap();
    assert_eq!(entry.as_bytes().unwrap().as_ref(), b"drained once");
}
