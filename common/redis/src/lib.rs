use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

// Re-export so consumers can build CustomRedisError values in tests
pub use redis::ErrorKind as RedisErrorKind;

#[derive(Error, Debug, Clone)]
pub enum CustomRedisError {
    #[error("Not found in redis")]
    NotFound,
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Timeout error")]
    Timeout,
    #[error(transparent)]
    Redis(#[from] Arc<redis::RedisError>),
}

impl From<redis::RedisError> for CustomRedisError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            CustomRedisError::Timeout
        } else {
            CustomRedisError::Redis(Arc::new(err))
        }
    }
}

impl From<std::string::FromUtf8Error> for CustomRedisError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        CustomRedisError::ParseError(err.to_string())
    }
}

impl CustomRedisError {
    /// Create a Redis error from an ErrorKind (primarily for testing)
    pub fn from_redis_kind(kind: redis::ErrorKind, description: &'static str) -> Self {
        CustomRedisError::Redis(Arc::new(redis::RedisError::from((kind, description))))
    }

    /// Whether retrying the same command later has a chance of succeeding.
    ///
    /// Timeouts and connection drops are transient; configuration and parse
    /// errors are not.
    pub fn is_transient(&self) -> bool {
        match self {
            CustomRedisError::Timeout => true,
            CustomRedisError::InvalidConfiguration(_) => false,
            CustomRedisError::ParseError(_) => false,
            CustomRedisError::NotFound => false,
            CustomRedisError::Redis(err) => {
                !matches!(
                    err.kind(),
                    redis::ErrorKind::InvalidClientConfig | redis::ErrorKind::AuthenticationFailed
                ) && !err.is_unrecoverable_error()
            }
        }
    }
}

/// The subset of Redis commands the identity pipeline needs.
///
/// Values are plain UTF-8 strings. List commands follow Redis semantics:
/// `lpush` adds to the head, `blmove` pops from the tail of `source` and
/// pushes to the head of `destination`, so a list used with both behaves as
/// a FIFO.
#[async_trait]
pub trait Client {
    async fn get(&self, k: String) -> Result<String, CustomRedisError>;
    async fn setex(&self, k: String, v: String, seconds: u64) -> Result<(), CustomRedisError>;
    async fn set_nx_ex(&self, k: String, v: String, seconds: u64)
        -> Result<bool, CustomRedisError>;
    async fn del(&self, k: String) -> Result<(), CustomRedisError>;
    /// Delete `k` only while it still holds `v`. Returns whether it was deleted.
    async fn del_if_eq(&self, k: String, v: String) -> Result<bool, CustomRedisError>;
    async fn exists(&self, k: String) -> Result<bool, CustomRedisError>;

    async fn lpush(&self, k: String, v: String) -> Result<(), CustomRedisError>;
    /// Blocking move of the tail of `source` onto the head of `destination`.
    /// Returns `None` if nothing arrived before `timeout`.
    async fn blmove(
        &self,
        source: String,
        destination: String,
        timeout: Duration,
    ) -> Result<Option<String>, CustomRedisError>;
    async fn lrange(
        &self,
        k: String,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, CustomRedisError>;
    async fn llen(&self, k: String) -> Result<u64, CustomRedisError>;
    /// Remove one occurrence of `v` from `k`. Returns whether anything was removed.
    async fn lrem(&self, k: String, v: String) -> Result<bool, CustomRedisError>;
    /// Atomically remove one occurrence of `v` from `source` and, only if it was
    /// present, push `replacement` onto the head of `destination`.
    async fn lrem_lpush(
        &self,
        source: String,
        v: String,
        destination: String,
        replacement: String,
    ) -> Result<bool, CustomRedisError>;

    async fn zadd(&self, k: String, member: String, score: f64) -> Result<(), CustomRedisError>;
    async fn zrem(&self, k: String, member: String) -> Result<(), CustomRedisError>;
    async fn zrangebyscore(
        &self,
        k: String,
        min: String,
        max: String,
    ) -> Result<Vec<String>, CustomRedisError>;

    /// Append an entry to a stream, trimming it to roughly `max_len` entries.
    async fn xadd(
        &self,
        stream: String,
        max_len: usize,
        fields: Vec<(String, String)>,
    ) -> Result<String, CustomRedisError>;
}

mod client;
mod mock;

pub use client::RedisClient;
pub use mock::{MockRedisCall, MockRedisClient};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_transient() {
        assert!(CustomRedisError::Timeout.is_transient());
    }

    #[test]
    fn test_parse_error_is_not_transient() {
        let err = CustomRedisError::ParseError("invalid data".to_string());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_not_found_is_not_transient() {
        assert!(!CustomRedisError::NotFound.is_transient());
    }

    #[test]
    fn test_io_error_is_transient() {
        let err = CustomRedisError::from_redis_kind(RedisErrorKind::IoError, "Connection refused");
        assert!(err.is_transient());
    }

    #[test]
    fn test_authentication_failed_is_not_transient() {
        let err = CustomRedisError::from_redis_kind(
            RedisErrorKind::AuthenticationFailed,
            "WRONGPASS invalid username-password pair",
        );
        assert!(!err.is_transient());
    }
}
