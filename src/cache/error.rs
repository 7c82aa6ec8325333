use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Object store error: {0}")]
    Store(String),
}

pub type CacheResult<T> = Result<T, CacheError>;
