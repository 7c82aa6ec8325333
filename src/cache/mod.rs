//! Read-through cache for the slow SSO listings.
//!
//! Only account lists and permission-set lists go through here: they are
//! large, rarely change, and are expensive to enumerate. The protocol in
//! [`resilient`] issues the cache read and the API read concurrently and
//! always prefers the API value, so there is no TTL to tune and staleness is
//! bounded by the next read. Cache failures are never visible to callers.

pub mod error;
mod keys;
mod resilient;
mod s3;
mod traits;

pub use error::{CacheError, CacheResult};
pub use keys::CacheKeys;
pub use resilient::read_through;
pub use s3::S3ObjectCache;
pub use traits::{ObjectCache, ObjectCacheExt};
