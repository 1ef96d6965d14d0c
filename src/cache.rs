use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::model::FinalPost;
use crate::posts::materialize;
use crate::sheets::TabularStore;

struct Snapshot {
    posts: Arc<[FinalPost]>,
    loaded_at: Instant,
}

/// The published post list, rebuilt from the store at most once per TTL.
///
/// Readers get an `Arc` to an immutable list, so a rebuild swaps the whole list at
/// once. Only one rebuild runs at a time; callers that arrive during a rebuild wait
/// for it and share its outcome, success or failure, instead of reading the store
/// again.
pub struct PostCache {
    store: Arc<dyn TabularStore>,
    range: String,
    ttl: Duration,
    snapshot: RwLock<Option<Snapshot>>,
    /// Held for the length of a rebuild. Holds the last rebuild's error, if it failed.
    refresh: Mutex<Option<String>>,
    /// Number of finished rebuilds, successful or not
    attempts: AtomicU64,
}

impl PostCache {
    pub fn new(store: Arc<dyn TabularStore>, range: &str, ttl: Duration) -> Self {
        Self {
            store,
            range: range.to_string(),
            ttl,
            snapshot: RwLock::new(None),
            refresh: Mutex::new(None),
            attempts: AtomicU64::new(0),
        }
    }

    async fn fresh(&self) -> Option<Arc<[FinalPost]>> {
        let snapshot = self.snapshot.read().await;
        snapshot
            .as_ref()
            .filter(|s| s.loaded_at.elapsed() < self.ttl)
            .map(|s| s.posts.clone())
    }

    async fn current(&self) -> Option<Arc<[FinalPost]>> {
        self.snapshot.read().await.as_ref().map(|s| s.posts.clone())
    }

    /// The current post list. When a rebuild fails the previous list is served if
    /// there is one; the next call tries the store again.
    pub async fn posts(&self) -> Result<Arc<[FinalPost]>> {
        if let Some(posts) = self.fresh().await {
            return Ok(posts);
        }

        let seen = self.attempts.load(Ordering::SeqCst);
        let mut last_error = self.refresh.lock().await;

        // Another caller may have finished a rebuild while we waited
        if let Some(posts) = self.fresh().await {
            return Ok(posts);
        }
        if self.attempts.load(Ordering::SeqCst) != seen {
            if let Some(message) = last_error.as_ref() {
                return match self.current().await {
                    Some(stale) => Ok(stale),
                    None => Err(Error::Refresh(message.clone())),
                };
            }
            if let Some(posts) = self.current().await {
                return Ok(posts);
            }
        }

        let outcome = self.rebuild().await;
        *last_error = outcome.as_ref().err().map(|e| e.to_string());
        self.attempts.fetch_add(1, Ordering::SeqCst);
        outcome
    }

    async fn rebuild(&self) -> Result<Arc<[FinalPost]>> {
        match self.store.get_range(&self.range).await {
            Ok(rows) => {
                let posts: Arc<[FinalPost]> = materialize(&rows, Utc::now()).into();
                info!("Materialized {} published posts from {} rows", posts.len(), rows.len());

                *self.snapshot.write().await = Some(Snapshot {
                    posts: posts.clone(),
                    loaded_at: Instant::now(),
                });
                Ok(posts)
            }
            Err(e) => {
                if let Some(stale) = self.current().await {
                    warn!("Post refresh failed, serving previous list: {}", e);
                    return Ok(stale);
                }
                error!("Post refresh failed with nothing cached: {}", e);
                Err(e)
            }
        }
    }

    /// Drops the cached list so the next read goes to the store.
    pub async fn invalidate(&self) {
        *self.snapshot.write().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sheets::MemoryStore;
    use serde_json::json;

    const RANGE: &str = "FINAL_BLOGS!A2:Q";

    fn seeded_store() -> MemoryStore {
        let store = MemoryStore::new();
        store.set_sheet("FINAL_BLOGS", vec![header(), live_row("1", "First story")]);
        store
    }

    fn header() -> Vec<serde_json::Value> {
        (0..17).map(|i| json!(format!("col{}", i))).collect()
    }

    fn live_row(id: &str, title: &str) -> Vec<serde_json::Value> {
        vec![
            json!(id),
            json!("src"),
            json!(title),
            json!(""),
            json!("body"),
            json!(""),
            json!("World"),
            json!("Desk"),
            json!("2024-05-01T00:00:00Z"),
            json!("TRUE"),
            json!("FALSE"),
            json!(""),
            json!(""),
            json!("LIVE"),
        ]
    }

    #[tokio::test]
    async fn test_reuses_list_within_ttl() {
        let store = Arc::new(seeded_store());
        let cache = PostCache::new(store.clone(), RANGE, Duration::from_secs(60));

        let first = cache.posts().await.unwrap();
        let second = cache.posts().await.unwrap();

        assert_eq!(first.len(), 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.read_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rebuilds_after_ttl() {
        let store = Arc::new(seeded_store());
        let cache = PostCache::new(store.clone(), RANGE, Duration::from_secs(60));

        assert_eq!(cache.posts().await.unwrap().len(), 1);

        store.set_sheet(
            "FINAL_BLOGS",
            vec![header(), live_row("1", "First story"), live_row("2", "Second story")],
        );
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(cache.posts().await.unwrap().len(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(cache.posts().await.unwrap().len(), 2);
        assert_eq!(store.read_count(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_reads_share_one_store_read() {
        let store = Arc::new(seeded_store().with_read_delay(Duration::from_millis(50)));
        let cache = Arc::new(PostCache::new(store.clone(), RANGE, Duration::from_secs(60)));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.posts().await })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().len(), 1);
        }
        assert_eq!(store.read_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_serves_previous_list() {
        let store = Arc::new(seeded_store());
        let cache = PostCache::new(store.clone(), RANGE, Duration::from_secs(60));

        let good = cache.posts().await.unwrap();

        store.set_failing(true);
        tokio::time::advance(Duration::from_secs(61)).await;
        let stale = cache.posts().await.unwrap();
        assert!(Arc::ptr_eq(&good, &stale));

        // Still stale, so the store is tried again
        cache.posts().await.unwrap();
        assert_eq!(store.read_count(), 3);
    }

    #[tokio::test]
    async fn test_failed_first_refresh_is_an_error() {
        let store = Arc::new(seeded_store());
        store.set_failing(true);
        let cache = PostCache::new(store.clone(), RANGE, Duration::from_secs(60));

        let result = cache.posts().await;
        assert!(matches!(result, Err(Error::RemoteStore { .. })));
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_failed_first_refresh() {
        let store = Arc::new(seeded_store().with_read_delay(Duration::from_millis(50)));
        store.set_failing(true);
        let cache = Arc::new(PostCache::new(store.clone(), RANGE, Duration::from_secs(60)));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.posts().await })
            })
            .collect();

        for handle in handles {
            assert!(handle.await.unwrap().is_err());
        }
        assert_eq!(store.read_count(), 1);

        // Once the failed rebuild is over, a new caller retries
        assert!(cache.posts().await.is_err());
        assert_eq!(store.read_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_stale_list_on_failure() {
        let store = Arc::new(seeded_store().with_read_delay(Duration::from_millis(50)));
        let cache = Arc::new(PostCache::new(store.clone(), RANGE, Duration::from_secs(60)));
        let good = cache.posts().await.unwrap();

        store.set_failing(true);
        tokio::time::advance(Duration::from_secs(61)).await;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.posts().await })
            })
            .collect();

        for handle in handles {
            let posts = handle.await.unwrap().unwrap();
            assert!(Arc::ptr_eq(&good, &posts));
        }
        assert_eq!(store.read_count(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_forces_reload() {
        let store = Arc::new(seeded_store());
        let cache = PostCache::new(store.clone(), RANGE, Duration::from_secs(60));

        cache.posts().await.unwrap();
        cache.invalidate().await;
        cache.posts().await.unwrap();
        assert_eq!(store.read_count(), 2);
    }

    #[tokio::test]
    async fn test_isolated_instances() {
        let a = Arc::new(seeded_store());
        let b = Arc::new(MemoryStore::new());
        let cache_a = PostCache::new(a.clone(), RANGE, Duration::from_secs(60));
        let cache_b = PostCache::new(b.clone(), RANGE, Duration::from_secs(60));

        assert_eq!(cache_a.posts().await.unwrap().len(), 1);
        assert!(cache_b.posts().await.unwrap().is_empty());
    }
}
