//! Sidecar Manager Module
//!
//! Multi-file mode support: allocates per-entry value files under the
//! store directory, streams values into them, and unlinks them when
//! entries are removed. Sidecar paths use a two-level fan-out
//! (`aa/rest-of-hex`) so no single directory grows unbounded.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use crate::cache::entry::{BoxedReader, CacheEntry, ReaderFactory, SidecarResult};
use crate::cache::signal::Signal;
use crate::error::{Result, StoreError};

// == Payload ==
/// Value captured from an entry when its sidecar write starts. Bytes
/// are materialized up front (through the serializer if needed); a
/// reader is streamed straight to disk.
pub(crate) enum Payload {
    Bytes(Bytes),
    Reader(ReaderFactory),
}

// == Path Allocation ==
/// Allocates a fresh relative sidecar path from a 128-bit random id.
///
/// Collisions are astronomically unlikely; no retry logic exists.
pub(crate) fn alloc_rel_path() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{}/{}", &hex[..2], &hex[2..])
}

// == Write ==
/// Writes a payload to the sidecar at `path`, creating parent
/// directories as needed.
pub(crate) async fn write_value(path: &Path, payload: Payload) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    match payload {
        Payload::Bytes(bytes) => {
            tokio::fs::write(path, &bytes).await?;
        }
        Payload::Reader(factory) => {
            let mut reader = factory().await?;
            let mut file = tokio::fs::File::create(path).await?;
            tokio::io::copy(&mut reader, &mut file).await?;
            file.flush().await?;
        }
    }
    Ok(())
}

// == Reader Factory ==
/// Builds a factory streaming the sidecar at `path`. While the sidecar
/// write is still in flight, each open waits on its signal first; a
/// failed write surfaces as an error from the factory.
pub(crate) fn sidecar_reader(
    path: PathBuf,
    pending: Option<Signal<SidecarResult>>,
) -> ReaderFactory {
    Arc::new(move || {
        let path = path.clone();
        let pending = pending.clone();
        Box::pin(async move {
            if let Some(signal) = pending {
                if let Err(err) = signal.wait().await {
                    return Err(StoreError::SidecarWrite(err));
                }
            }
            let file = tokio::fs::File::open(&path).await?;
            Ok(Box::new(file) as BoxedReader)
        })
    })
}

// == Delete ==
/// Unlinks the sidecar belonging to a removed entry.
///
/// An in-flight write is waited out first (its signal resolves to the
/// final relative path). Unlink failures are swallowed: after the next
/// flush the catalog no longer references the file, and an orphan on
/// disk is acceptable.
pub(crate) async fn remove_entry_file(dir: &Path, entry: &CacheEntry) {
    let rel = if let Some(signal) = entry.write_signal.clone() {
        match signal.wait().await {
            Ok(rel) => rel,
            Err(_) => return,
        }
    } else if let Some(rel) = entry.sidecar_path() {
        rel.to_string()
    } else {
        return;
    };

    let path = dir.join(&rel);
    if let Err(err) = tokio::fs::remove_file(&path).await {
        debug!("sidecar unlink skipped for {}: {}", path.display(), err);
    }
}
