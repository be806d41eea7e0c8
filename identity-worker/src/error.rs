use common_redis::CustomRedisError;
use identity_common::idempotency::IdempotencyError;
use identity_common::lock::LockError;
use identity_common::queue::QueueError;
use identity_common::store::StoreError;
use thiserror::Error;

/// Errors that can occur while merging candidate profiles.
#[derive(Error, Debug)]
pub enum MergeError {
    #[error("a merge needs at least two distinct profiles, got {0}")]
    InsufficientCandidates(usize),
    #[error("only {found} of the candidate profiles still exist")]
    NotFound { found: usize },
    #[error("failed to take the merge lock: {0}")]
    Lock(#[from] LockError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl MergeError {
    /// Whether the merge failed because profiles disappeared under it, in which
    /// case resolving the identifiers again will find the survivor.
    pub fn is_not_found(&self) -> bool {
        match self {
            MergeError::NotFound { .. } => true,
            MergeError::Store(e) => e.is_not_found(),
            _ => false,
        }
    }
}

/// Errors that can occur while ingesting one event.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error("idempotency check failed: {0}")]
    Idempotency(#[from] IdempotencyError),
}

impl IngestError {
    pub fn is_not_found(&self) -> bool {
        match self {
            IngestError::Store(e) => e.is_not_found(),
            IngestError::Merge(e) => e.is_not_found(),
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("failed to write to stream {stream}: {error}")]
    Redis {
        stream: &'static str,
        error: CustomRedisError,
    },
    #[error("failed to serialize stream entry: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors that stop a worker from making progress on the queue.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("a queue error occurred while processing events: {0}")]
    Queue(#[from] QueueError),
}

impl WorkerError {
    pub fn is_transient(&self) -> bool {
        match self {
            WorkerError::Queue(e) => e.is_transient(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_not_found_is_detected_through_wrappers() {
        let missing = StoreError::profile_not_found(Uuid::now_v7());
        assert!(IngestError::from(MergeError::from(missing)).is_not_found());
        assert!(IngestError::from(MergeError::NotFound { found: 1 }).is_not_found());

        assert!(!IngestError::from(MergeError::InsufficientCandidates(1)).is_not_found());
        assert!(!IngestError::Store(StoreError::Conflict("dup".to_string())).is_not_found());
    }

    #[test]
    fn test_only_backend_hiccups_are_transient() {
        assert!(WorkerError::from(QueueError::Redis(CustomRedisError::Timeout)).is_transient());

        let parse = CustomRedisError::ParseError("bad utf-8".to_string());
        assert!(!WorkerError::from(QueueError::Redis(parse)).is_transient());
    }
}
