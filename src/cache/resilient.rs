use std::future::Future;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::traits::{ObjectCache, ObjectCacheExt};

/// Read a listing through the cache.
///
/// The cache read and the API read run concurrently. The API value always
/// wins when it arrives; the cache is only written when the parsed values
/// differ (byte-level comparison would churn on field ordering). The cached
/// value is served only when the API fails, with a warning naming the API
/// error. Cache reads and writes never fail the caller: with a broken cache
/// the observable result is identical to running with the cache disabled.
pub async fn read_through<T, E, Fut>(
    cache: Option<&dyn ObjectCache>,
    key: &str,
    api_call: Fut,
) -> Result<T, E>
where
    T: Serialize + DeserializeOwned + PartialEq + Sync,
    E: std::fmt::Display,
    Fut: Future<Output = Result<T, E>>,
{
    let Some(cache) = cache else {
        return api_call.await;
    };

    let (api_result, cache_result) = tokio::join!(api_call, cache.get_json::<T>(key));

    let cached = match cache_result {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(key, error = %err, "Cache read failed; continuing with API result");
            None
        }
    };

    match (api_result, cached) {
        (Ok(api_value), cached) => {
            let stale = match &cached {
                Some(cached_value) => *cached_value != api_value,
                None => true,
            };
            if stale {
                if let Err(err) = cache.put_json(key, &api_value).await {
                    tracing::warn!(key, error = %err, "Cache write-through failed");
                } else {
                    tracing::debug!(key, "Cache updated from API value");
                }
            }
            Ok(api_value)
        }
        (Err(api_err), Some(cached_value)) => {
            tracing::warn!(
                key,
                error = %api_err,
                "API listing failed; serving cached value"
            );
            Ok(cached_value)
        }
        (Err(api_err), None) => Err(api_err),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::cache::error::{CacheError, CacheResult};

    #[derive(Default)]
    struct MemoryCache {
        objects: Mutex<HashMap<String, Vec<u8>>>,
        fail_reads: bool,
        fail_writes: bool,
        writes: AtomicUsize,
    }

    #[async_trait]
    impl ObjectCache for MemoryCache {
        async fn get_bytes(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
            if self.fail_reads {
                return Err(CacheError::Store("read failed".into()));
            }
            Ok(self.objects.lock().unwrap().get(key).cloned())
        }

        async fn put_bytes(&self, key: &str, value: &[u8]) -> CacheResult<()> {
            if self.fail_writes {
                return Err(CacheError::Store("write failed".into()));
            }
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.objects
                .lock()
                .unwrap()
                .insert(key.to_string(), value.to_vec());
            Ok(())
        }
    }

    fn seeded(key: &str, value: &[&str]) -> MemoryCache {
        let cache = MemoryCache::default();
        cache.objects.lock().unwrap().insert(
            key.to_string(),
            serde_json::to_vec(&value.to_vec()).unwrap(),
        );
        cache
    }

    #[tokio::test]
    async fn api_value_wins_and_equal_cache_is_not_rewritten() {
        let cache = seeded("k", &["a", "b"]);
        let result: Result<Vec<String>, String> = read_through(Some(&cache as &dyn ObjectCache), "k", async {
            Ok(vec!["a".to_string(), "b".to_string()])
        })
        .await;
        assert_eq!(result.unwrap(), vec!["a", "b"]);
        assert_eq!(cache.writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn differing_cache_is_written_through() {
        let cache = seeded("k", &["stale"]);
        let result: Result<Vec<String>, String> =
            read_through(Some(&cache as &dyn ObjectCache), "k", async { Ok(vec!["fresh".to_string()]) }).await;
        assert_eq!(result.unwrap(), vec!["fresh"]);
        assert_eq!(cache.writes.load(Ordering::SeqCst), 1);
        let stored: Vec<String> = cache.get_json("k").await.unwrap().unwrap();
        assert_eq!(stored, vec!["fresh"]);
    }

    #[tokio::test]
    async fn missing_cache_entry_is_populated() {
        let cache = MemoryCache::default();
        let result: Result<Vec<String>, String> =
            read_through(Some(&cache as &dyn ObjectCache), "k", async { Ok(vec!["v".to_string()]) }).await;
        assert_eq!(result.unwrap(), vec!["v"]);
        assert_eq!(cache.writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cached_value_serves_api_failure() {
        let cache = seeded("k", &["kept"]);
        let result: Result<Vec<String>, String> =
            read_through(Some(&cache as &dyn ObjectCache), "k", async { Err("api down".to_string()) }).await;
        assert_eq!(result.unwrap(), vec!["kept"]);
    }

    #[tokio::test]
    async fn both_failing_propagates_the_api_error() {
        let cache = MemoryCache { fail_reads: true, ..Default::default() };
        let result: Result<Vec<String>, String> =
            read_through(Some(&cache as &dyn ObjectCache), "k", async { Err("api down".to_string()) }).await;
        assert_eq!(result.unwrap_err(), "api down");
    }

    #[tokio::test]
    async fn cache_failures_are_invisible_to_the_caller() {
        // Same API result with a fully broken cache as with no cache at all.
        let broken = MemoryCache { fail_reads: true, fail_writes: true, ..Default::default() };
        let with_broken: Result<Vec<String>, String> =
            read_through(Some(&broken as &dyn ObjectCache), "k", async { Ok(vec!["v".to_string()]) }).await;
        let without: Result<Vec<String>, String> =
            read_through(None, "k", async { Ok(vec!["v".to_string()]) }).await;
        assert_eq!(with_broken.unwrap(), without.unwrap());
    }
}
