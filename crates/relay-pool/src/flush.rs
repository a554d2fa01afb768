//! Debounced background persistence
//!
//! Spawns a task that waits for the store's dirty signal, sleeps a
//! debounce window so bursts of mutations coalesce into one write, then
//! persists a snapshot. Request-serving paths never wait on the file.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::credentials::CredentialStore;

/// Spawn the flush task for a store.
///
/// Mutations arriving while the flush sleeps are included in the written
/// snapshot; a signal arriving during the write schedules one more pass.
/// Write failures are logged and retried on the next dirty signal.
///
/// Returns a `JoinHandle` so the owner can abort the task on shutdown
/// (followed by a direct `flush()` for the final snapshot).
pub fn spawn_flush_task(
    store: Arc<CredentialStore>,
    debounce: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            store.dirty_notified().await;
            tokio::time::sleep(debounce).await;
            match store.flush().await {
                Ok(()) => debug!("credential state flushed"),
                Err(e) => warn!(error = %e, "credential flush failed, will retry on next change"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Secret;

    #[tokio::test]
    async fn burst_of_mutations_coalesces_into_one_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        let store = Arc::new(CredentialStore::load(path.clone()).await.unwrap());
        store
            .merge_configured(&[Secret::new("tok-a".to_string())])
            .await;
        let id = store.snapshot().await[0].id.clone();

        let task = spawn_flush_task(store.clone(), Duration::from_millis(20));

        for _ in 0..5 {
            store.record_failure(&id).await.unwrap();
        }

        // Wait past the debounce window for the flush to land
        let mut flushed = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let contents = tokio::fs::read_to_string(&path).await.unwrap();
            if contents.contains("\"consecutive_failures\": 5") {
                flushed = true;
                break;
            }
        }
        assert!(flushed, "flushed snapshot should carry the final state");
        task.abort();
    }

    #[tokio::test]
    async fn idle_store_is_not_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        let store = Arc::new(CredentialStore::load(path.clone()).await.unwrap());

        let task = spawn_flush_task(store.clone(), Duration::from_millis(10));
        let before = tokio::fs::metadata(&path).await.unwrap().modified().unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let after = tokio::fs::metadata(&path).await.unwrap().modified().unwrap();
        assert_eq!(before, after, "no dirty signal means no write");
        task.abort();
    }
}
