use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::errors::AppResult;
use crate::retry::RetryPolicy;
use crate::store::{keys, read_json, write_json, BlobStore};

pub type FrequencyMap = HashMap<String, u64>;

pub struct FrequencyTracker {
    store: Arc<dyn BlobStore>,
    retry: RetryPolicy,
    write_guard: AsyncMutex<()>,
}

impl FrequencyTracker {
    pub fn new(store: Arc<dyn BlobStore>, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            write_guard: AsyncMutex::new(()),
        }
    }

    pub async fn increment(&self, place_id: &str) -> AppResult<u64> {
        let _serialized = self.write_guard.lock().await;
        let mut counts = self.load().await?;
        let count = counts.entry(place_id.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        let updated = *count;

        // The whole map is written each time, so retrying the write is harmless.
        self.retry
            .execute("frequency_persist", || {
                write_json(self.store.as_ref(), keys::FREQUENCY, &counts)
            })
            .await?;
        debug!(target: "frequency", place_id, count = updated, "access recorded");
        Ok(updated)
    }

    pub async fn get(&self, place_id: &str) -> AppResult<u64> {
        Ok(self.load().await?.get(place_id).copied().unwrap_or(0))
    }

    pub async fn load(&self) -> AppResult<FrequencyMap> {
        let store = self.store.as_ref();
        match self
            .retry
            .execute("frequency_load", || read_json::<FrequencyMap>(store, keys::FREQUENCY))
            .await
        {
            Ok(counts) => Ok(counts),
            Err(err) if err.is_not_found() => Ok(FrequencyMap::new()),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::errors::AppError;
    use crate::store::MemoryBlobStore;

    fn tracker(store: &MemoryBlobStore) -> FrequencyTracker {
        FrequencyTracker::new(
            Arc::new(store.clone()),
            RetryPolicy::new(3, Duration::from_millis(5)),
        )
    }

    #[tokio::test]
    async fn missing_counter_defaults_to_zero() {
        let store = MemoryBlobStore::new();
        let tracker = tracker(&store);
        assert_eq!(tracker.get("place_1").await.unwrap(), 0);
        assert_eq!(tracker.increment("place_1").await.unwrap(), 1);
        assert_eq!(tracker.increment("place_1").await.unwrap(), 2);
        assert_eq!(tracker.get("place_1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn persists_counts_for_other_readers() {
        let store = MemoryBlobStore::new();
        store.insert_json(keys::FREQUENCY, &json!({ "place_1": 19, "place_2": 3 }));
        let tracker = tracker(&store);
        tracker.increment("place_1").await.unwrap();

        let persisted: FrequencyMap = store.get_json(keys::FREQUENCY).unwrap();
        assert_eq!(persisted["place_1"], 20);
        assert_eq!(persisted["place_2"], 3);
    }

    #[tokio::test]
    async fn retries_the_persist_step_without_double_counting() {
        let store = MemoryBlobStore::new();
        let tracker = tracker(&store);
        store.fail_next_writes(2);
        assert_eq!(tracker.increment("a").await.unwrap(), 1);
        assert_eq!(store.write_count(keys::FREQUENCY), 3);
        assert_eq!(tracker.get("a").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn concurrent_increments_are_not_lost() {
        let store = MemoryBlobStore::new();
        let tracker = Arc::new(tracker(&store));
        let mut handles = Vec::new();
        for _ in 0..10 {
            let tracker = Arc::clone(&tracker);
            handles.push(tokio::spawn(async move { tracker.increment("hot").await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(tracker.get("hot").await.unwrap(), 10);
    }

    #[tokio::test]
    async fn malformed_counter_document_is_an_integrity_error() {
        let store = MemoryBlobStore::new();
        store.insert_json(keys::FREQUENCY, &json!(["not", "a", "map"]));
        let tracker = tracker(&store);
        assert!(matches!(
            tracker.increment("a").await,
            Err(AppError::Integrity(_))
        ));
    }
}
