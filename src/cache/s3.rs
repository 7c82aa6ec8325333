use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;

use super::error::{CacheError, CacheResult};
use super::traits::ObjectCache;

/// Listing cache backed by the config bucket.
#[derive(Clone)]
pub struct S3ObjectCache {
    client: Client,
    bucket: String,
}

impl S3ObjectCache {
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self { client, bucket: bucket.into() }
    }
}

#[async_trait]
impl ObjectCache for S3ObjectCache {
    async fn get_bytes(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(out) => {
                let bytes = out
                    .body
                    .collect()
                    .await
                    .map_err(|e| CacheError::Store(e.to_string()))?;
                Ok(Some(bytes.into_bytes().to_vec()))
            }
            Err(err) => {
                let service_error = err.into_service_error();
                if service_error.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(CacheError::Store(service_error.to_string()))
                }
            }
        }
    }

    async fn put_bytes(&self, key: &str, value: &[u8]) -> CacheResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(value.to_vec()))
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| CacheError::Store(e.into_service_error().to_string()))?;
        Ok(())
    }
}
