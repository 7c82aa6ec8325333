use async_trait::async_trait;

use super::error::{CacheError, CacheResult};

/// Storage seam for the listing cache. One implementation backed by the
/// object store ships in [`super::S3ObjectCache`]; tests use in-memory
/// doubles.
#[async_trait]
pub trait ObjectCache: Send + Sync {
    /// Get raw bytes for a key. `None` means the key is absent.
    async fn get_bytes(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Store raw bytes under a key, overwriting any previous value.
    async fn put_bytes(&self, key: &str, value: &[u8]) -> CacheResult<()>;
}

/// JSON helpers over any [`ObjectCache`].
#[async_trait]
pub trait ObjectCacheExt: ObjectCache {
    async fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> CacheResult<Option<T>> {
        match self.get_bytes(key).await? {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| CacheError::Deserialization(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn put_json<T: serde::Serialize + Sync>(&self, key: &str, value: &T) -> CacheResult<()> {
        let bytes =
            serde_json::to_vec(value).map_err(|e| CacheError::Serialization(e.to_string()))?;
        self.put_bytes(key, &bytes).await
    }
}

#[async_trait]
impl<T: ObjectCache + ?Sized> ObjectCacheExt for T {}
