use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common_redis::{Client, CustomRedisError};
use thiserror::Error;
use uuid::Uuid;

pub const MERGE_LOCK_PREFIX: &str = "lock:merge:";
pub const DEFAULT_MERGE_LOCK_TTL: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum LockError {
    #[error("lock on profile {0} is already held")]
    AlreadyHeld(Uuid),
    #[error(transparent)]
    Redis(#[from] CustomRedisError),
}

/// A held merge lock. Only the holder knows the token, so only the holder can
/// release it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeLock {
    pub profile_id: Uuid,
    token: String,
}

impl MergeLock {
    pub fn new(profile_id: Uuid) -> Self {
        Self {
            profile_id,
            token: Uuid::new_v4().to_string(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

pub fn merge_lock_key(profile_id: Uuid) -> String {
    format!("{MERGE_LOCK_PREFIX}{profile_id}")
}

/// Service for acquiring per-profile merge locks.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Acquire the lock for `profile_id` without waiting.
    /// Returns `LockError::AlreadyHeld` if another holder has it.
    async fn acquire(&self, profile_id: Uuid) -> Result<MergeLock, LockError>;

    /// Release a held lock. Returns false if it had already expired or been
    /// taken over by someone else.
    async fn release(&self, lock: &MergeLock) -> Result<bool, LockError>;

    async fn is_locked(&self, profile_id: Uuid) -> Result<bool, LockError>;
}

/// Merge locks stored as `lock:merge:{profile_id}` keys holding a random
/// token, set with `SET NX EX` and removed with compare-and-delete.
pub struct RedisLockService {
    client: Arc<dyn Client + Send + Sync>,
    ttl: Duration,
}

impl RedisLockService {
    pub fn new(client: Arc<dyn Client + Send + Sync>, ttl: Duration) -> Self {
        Self { client, ttl }
    }

    fn ttl_secs(&self) -> u64 {
        self.ttl.as_secs().max(1)
    }
}

#[async_trait]
impl LockService for RedisLockService {
    async fn acquire(&self, profile_id: Uuid) -> Result<MergeLock, LockError> {
        let lock = MergeLock::new(profile_id);
        let acquired = self
            .client
            .set_nx_ex(
                merge_lock_key(profile_id),
                lock.token.clone(),
                self.ttl_secs(),
            )
            .await?;

        if acquired {
            Ok(lock)
        } else {
            Err(LockError::AlreadyHeld(profile_id))
        }
    }

    async fn release(&self, lock: &MergeLock) -> Result<bool, LockError> {
        Ok(self
            .client
            .del_if_eq(merge_lock_key(lock.profile_id), lock.token.clone())
            .await?)
    }

    async fn is_locked(&self, profile_id: Uuid) -> Result<bool, LockError> {
        Ok(self.client.exists(merge_lock_key(profile_id)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common_redis::MockRedisClient;

    fn service(client: &MockRedisClient) -> RedisLockService {
        RedisLockService::new(Arc::new(client.clone()), DEFAULT_MERGE_LOCK_TTL)
    }

    #[tokio::test]
    async fn test_second_acquire_is_rejected() {
        let client = MockRedisClient::new();
        let locks = service(&client);
        let profile_id = Uuid::now_v7();

        let held = locks.acquire(profile_id).await.unwrap();
        let second = locks.acquire(profile_id).await;

        assert!(matches!(second, Err(LockError::AlreadyHeld(id)) if id == profile_id));
        assert!(locks.is_locked(profile_id).await.unwrap());

        assert!(locks.release(&held).await.unwrap());
        assert!(!locks.is_locked(profile_id).await.unwrap());
        assert!(locks.acquire(profile_id).await.is_ok());
    }

    #[tokio::test]
    async fn test_release_with_foreign_token_is_a_noop() {
        let client = MockRedisClient::new();
        let locks = service(&client);
        let profile_id = Uuid::now_v7();

        let _held = locks.acquire(profile_id).await.unwrap();
        let impostor = MergeLock::new(profile_id);

        assert!(!locks.release(&impostor).await.unwrap());
        assert!(locks.is_locked(profile_id).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_expires_after_ttl() {
        let client = MockRedisClient::new();
        let locks = service(&client);
        let profile_id = Uuid::now_v7();

        let held = locks.acquire(profile_id).await.unwrap();
        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(locks.is_locked(profile_id).await.unwrap());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!locks.is_locked(profile_id).await.unwrap());
        assert!(!locks.release(&held).await.unwrap());
    }

    #[tokio::test]
    async fn test_keys_use_merge_prefix() {
        let client = MockRedisClient::new();
        let locks = service(&client);
        let profile_id = Uuid::now_v7();

        locks.acquire(profile_id).await.unwrap();

        let calls = client.get_calls();
        assert_eq!(calls[0].op, "set_nx_ex");
        assert_eq!(calls[0].key, format!("lock:merge:{profile_id}"));
    }

    #[tokio::test]
    async fn test_backend_errors_are_not_contention() {
        let client = MockRedisClient::new().fail_op("set_nx_ex", CustomRedisError::Timeout);
        let locks = service(&client);

        let result = locks.acquire(Uuid::now_v7()).await;

        assert!(matches!(
            result,
            Err(LockError::Redis(CustomRedisError::Timeout))
        ));
    }
}
