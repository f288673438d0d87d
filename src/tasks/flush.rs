//! Deferred Flush Task
//!
//! Background task that fires one coalesced flush after the configured
//! delay. Every mutation re-arms the timer with a fresh generation; a
//! timer whose generation has been superseded wakes up, notices, and
//! does nothing, so a burst of mutations inside the delay window
//! produces exactly one flush.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::CacheStore;

/// Spawns the deferred flush timer for one scheduling generation.
///
/// The task sleeps for `delay`, checks that no later mutation or direct
/// flush superseded this generation, and then drives a flush. Flush
/// failures are logged here; the store stays dirty and retries on the
/// next flush.
///
/// # Arguments
/// * `store` - Store handle the flush runs against
/// * `delay` - Coalescing window configured for the store
/// * `generation` - Timer generation this task was armed with
pub(crate) fn spawn_flush_timer(
    store: CacheStore,
    delay: Duration,
    generation: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;

        if !store.timer_current(generation) {
            debug!("deferred flush superseded; skipping");
            return;
        }
        if let Err(err) = store.flush().await {
            warn!("deferred flush failed: {}", err);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[tokio::test]
    async fn test_deferred_flush_commits_mutations() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(
            Config::new()
                .with_dir(dir.path())
                .with_flush_delay(Some(Duration::from_millis(20))),
        )
        .unwrap();

        store.put("k", "v").unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert!(store.catalog_path().exists());
        assert_eq!(store.stats().flushes, 1);
    }

    #[tokio::test]
    async fn test_burst_coalesces_into_one_flush() {
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
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(store.stats().flushes, 1);
        assert_eq!(store.stats().total_entries, 3);
    }

    #[tokio::test]
    async fn test_disabled_flush_never_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(
            Config::new().with_dir(dir.path()).with_flush_delay(None),
        )
        .unwrap();

        store.put("k", "v").unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!store.catalog_path().exists());
    }
}
