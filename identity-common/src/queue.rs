//! # Queue
//!
//! A durable event queue on Redis lists. Every event lives in exactly one of
//! three lists: pending (`{prefix}:queue`), processing (`{prefix}:processing`)
//! and failed (`{prefix}:failed`). Moves between lists are atomic, so an event
//! is never lost nor duplicated by a crash between two commands. Events held
//! by a worker carry a lease in `{prefix}:leases`; an expired lease means the
//! worker died and the event is handed back to pending.
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use common_redis::{Client, CustomRedisError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::idempotency::ExternalTransaction;
use crate::metrics_consts::{
    EVENTS_COMPLETED, EVENTS_DEQUEUED, EVENTS_ENQUEUED, EVENTS_FAILED, EVENTS_RECLAIMED,
    EVENTS_RETRIED, MALFORMED_QUEUE_ITEMS,
};
use crate::retry::RetryPolicy;

pub const DEFAULT_QUEUE_PREFIX: &str = "events";
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Error, Debug)]
pub enum QueueError {
    #[error(transparent)]
    Redis(#[from] CustomRedisError),
    #[error("could not serialize queued event: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QueueError {
    /// Whether the same call may succeed later without intervention.
    pub fn is_transient(&self) -> bool {
        match self {
            QueueError::Redis(e) => e.is_transient(),
            QueueError::Serialization(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedEvent {
    pub id: Uuid,
    pub tenant_id: String,
    pub event_type: String,
    pub payload: Value,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_transaction: Option<ExternalTransaction>,
}

// The chunk of data needed to enqueue an event
#[derive(Debug, Clone, PartialEq)]
pub struct NewQueuedEvent {
    pub tenant_id: String,
    pub event_type: String,
    pub payload: Value,
    pub external_transaction: Option<ExternalTransaction>,
}

impl NewQueuedEvent {
    pub fn new(tenant_id: &str, event_type: &str, payload: Value) -> Self {
        Self {
            tenant_id: tenant_id.to_owned(),
            event_type: event_type.to_owned(),
            payload,
            external_transaction: None,
        }
    }

    pub fn with_external_transaction(mut self, transaction: ExternalTransaction) -> Self {
        self.external_transaction = Some(transaction);
        self
    }
}

/// An event taken off the pending list. `raw` is the exact processing-list
/// entry, needed to remove it again.
#[derive(Debug, Clone, PartialEq)]
pub struct DequeuedEvent {
    pub event: QueuedEvent,
    raw: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedEvent {
    #[serde(flatten)]
    pub event: QueuedEvent,
    pub error: String,
    pub failed_at: DateTime<Utc>,
    /// When the janitor should retry this event. `None` once attempts are
    /// exhausted: the event then stays failed until retried by hand.
    #[serde(default)]
    pub retry_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    RetryScheduled { retry_at: DateTime<Utc> },
    Exhausted,
}

impl FailureDisposition {
    fn label(&self) -> &'static str {
        match self {
            FailureDisposition::RetryScheduled { .. } => "retry_scheduled",
            FailureDisposition::Exhausted => "exhausted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueKeys {
    pending: String,
    processing: String,
    failed: String,
    leases: String,
}

impl QueueKeys {
    fn new(prefix: &str) -> Self {
        Self {
            pending: format!("{prefix}:queue"),
            processing: format!("{prefix}:processing"),
            failed: format!("{prefix}:failed"),
            leases: format!("{prefix}:leases"),
        }
    }
}

fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

fn score(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64
}

pub struct EventQueue {
    client: Arc<dyn Client + Send + Sync>,
    keys: QueueKeys,
    retry_policy: RetryPolicy,
    visibility_timeout: Duration,
}

impl EventQueue {
    pub fn new(client: Arc<dyn Client + Send + Sync>, prefix: &str, retry_policy: RetryPolicy) -> Self {
        Self {
            client,
            keys: QueueKeys::new(prefix),
            retry_policy,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
        }
    }

    /// How long a dequeued event may stay in processing before it is
    /// considered orphaned.
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Enqueue an event for asynchronous ingestion. Returns immediately with the
    /// event id the raw event will be stored under.
    pub async fn enqueue(
        &self,
        tenant_id: &str,
        event_type: &str,
        payload: Value,
    ) -> Result<Uuid, QueueError> {
        self.enqueue_event(NewQueuedEvent::new(tenant_id, event_type, payload))
            .await
    }

    pub async fn enqueue_event(&self, new: NewQueuedEvent) -> Result<Uuid, QueueError> {
        let event = QueuedEvent {
            id: Uuid::now_v7(),
            tenant_id: new.tenant_id,
            event_type: new.event_type,
            payload: new.payload,
            enqueued_at: Utc::now(),
            retries: 0,
            external_transaction: new.external_transaction,
        };
        let raw = serde_json::to_string(&event)?;

        self.client.lpush(self.keys.pending.clone(), raw).await?;

        metrics::counter!(EVENTS_ENQUEUED, "event_type" => event.event_type.clone()).increment(1);
        debug!(event_id = %event.id, tenant_id = %event.tenant_id, "enqueued event");
        Ok(event.id)
    }

    /// Move the oldest pending event to processing, waiting up to `timeout` for
    /// one to arrive. Entries that cannot be parsed are moved straight to
    /// failed and the call returns `None`.
    pub async fn dequeue(&self, timeout: Duration) -> Result<Option<DequeuedEvent>, QueueError> {
        let Some(raw) = self
            .client
            .blmove(
                self.keys.pending.clone(),
                self.keys.processing.clone(),
                timeout,
            )
            .await?
        else {
            return Ok(None);
        };

        let event: QueuedEvent = match serde_json::from_str(&raw) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "moving malformed queue item to failed");
                metrics::counter!(MALFORMED_QUEUE_ITEMS).increment(1);
                self.client
                    .lrem_lpush(
                        self.keys.processing.clone(),
                        raw.clone(),
                        self.keys.failed.clone(),
                        raw,
                    )
                    .await?;
                return Ok(None);
            }
        };

        let lease_until = Utc::now() + to_delta(self.visibility_timeout);
        self.client
            .zadd(self.keys.leases.clone(), raw.clone(), score(lease_until))
            .await?;

        metrics::counter!(EVENTS_DEQUEUED).increment(1);
        Ok(Some(DequeuedEvent { event, raw }))
    }

    /// Remove a successfully processed event from processing.
    pub async fn complete(&self, dequeued: &DequeuedEvent) -> Result<(), QueueError> {
        let removed = self
            .client
            .lrem(self.keys.processing.clone(), dequeued.raw.clone())
            .await?;
        self.client
            .zrem(self.keys.leases.clone(), dequeued.raw.clone())
            .await?;

        if !removed {
            warn!(event_id = %dequeued.event.id, "completed event was no longer in processing");
        }
        metrics::counter!(EVENTS_COMPLETED).increment(1);
        Ok(())
    }

    /// Move an event that failed processing to the failed list, recording the
    /// error and, if the retry policy allows another attempt, when to retry.
    pub async fn fail(
        &self,
        dequeued: &DequeuedEvent,
        error: &str,
    ) -> Result<FailureDisposition, QueueError> {
        let now = Utc::now();
        let attempt = dequeued.event.retries + 1;
        let disposition = if self.retry_policy.should_retry(attempt) {
            FailureDisposition::RetryScheduled {
                retry_at: now + to_delta(self.retry_policy.retry_interval(attempt)),
            }
        } else {
            FailureDisposition::Exhausted
        };

        let failed = FailedEvent {
            event: dequeued.event.clone(),
            error: error.to_owned(),
            failed_at: now,
            retry_at: match disposition {
                FailureDisposition::RetryScheduled { retry_at } => Some(retry_at),
                FailureDisposition::Exhausted => None,
            },
        };

        let moved = self
            .client
            .lrem_lpush(
                self.keys.processing.clone(),
                dequeued.raw.clone(),
                self.keys.failed.clone(),
                serde_json::to_string(&failed)?,
            )
            .await?;
        self.client
            .zrem(self.keys.leases.clone(), dequeued.raw.clone())
            .await?;

        if !moved {
            warn!(event_id = %dequeued.event.id, "failed event was no longer in processing");
        }
        metrics::counter!(EVENTS_FAILED, "disposition" => disposition.label()).increment(1);
        Ok(disposition)
    }

    /// Re-enqueue one failed event by id, regardless of its retry schedule.
    /// Returns false if no failed event has that id.
    pub async fn retry_failed(&self, event_id: Uuid) -> Result<bool, QueueError> {
        for (raw, failed) in self.failed_entries().await? {
            if failed.event.id == event_id {
                return self.requeue(raw, failed).await;
            }
        }
        Ok(false)
    }

    /// Re-enqueue every failed event whose retry time has passed.
    pub async fn retry_due(&self, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let mut retried = 0;
        for (raw, failed) in self.failed_entries().await? {
            if failed.retry_at.is_some_and(|at| at <= now) && self.requeue(raw, failed).await? {
                retried += 1;
            }
        }
        Ok(retried)
    }

    /// Hand events whose lease expired back to pending, counting the lost
    /// attempt. Events that have used up their attempts go to failed instead.
    ///
    /// A worker can die between taking an event and recording its lease. Such
    /// events are given a lease starting at `now`, so a later call reclaims
    /// them.
    pub async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<usize, QueueError> {
        self.lease_unleased(now).await?;

        let expired = self
            .client
            .zrangebyscore(
                self.keys.leases.clone(),
                "-inf".to_string(),
                score(now).to_string(),
            )
            .await?;

        let mut reclaimed = 0;
        for raw in expired {
            let event: Option<QueuedEvent> = serde_json::from_str(&raw).ok();
            let (destination, replacement) = match event {
                Some(mut event) => {
                    event.retries += 1;
                    if self.retry_policy.should_retry(event.retries) {
                        (self.keys.pending.clone(), serde_json::to_string(&event)?)
                    } else {
                        let failed = FailedEvent {
                            event,
                            error: "processing lease expired".to_string(),
                            failed_at: now,
                            retry_at: None,
                        };
                        (self.keys.failed.clone(), serde_json::to_string(&failed)?)
                    }
                }
                None => (self.keys.failed.clone(), raw.clone()),
            };

            let moved = self
                .client
                .lrem_lpush(
                    self.keys.processing.clone(),
                    raw.clone(),
                    destination,
                    replacement,
                )
                .await?;
            self.client.zrem(self.keys.leases.clone(), raw).await?;

            if moved {
                reclaimed += 1;
            }
        }

        if reclaimed > 0 {
            info!(reclaimed, "reclaimed events with expired leases");
            metrics::counter!(EVENTS_RECLAIMED).increment(reclaimed as u64);
        }
        Ok(reclaimed)
    }

    async fn lease_unleased(&self, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let processing = self
            .client
            .lrange(self.keys.processing.clone(), 0, -1)
            .await?;
        if processing.is_empty() {
            return Ok(0);
        }
        let leased: HashSet<String> = self
            .client
            .zrangebyscore(
                self.keys.leases.clone(),
                "-inf".to_string(),
                "+inf".to_string(),
            )
            .await?
            .into_iter()
            .collect();

        let lease_until = score(now + to_delta(self.visibility_timeout));
        let mut stamped = 0;
        for raw in processing {
            if leased.contains(&raw) {
                continue;
            }
            self.client
                .zadd(self.keys.leases.clone(), raw, lease_until)
                .await?;
            stamped += 1;
        }

        if stamped > 0 {
            warn!(stamped, "found processing events without a lease");
        }
        Ok(stamped)
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        Ok(QueueStats {
            pending: self.client.llen(self.keys.pending.clone()).await?,
            processing: self.client.llen(self.keys.processing.clone()).await?,
            failed: self.client.llen(self.keys.failed.clone()).await?,
        })
    }

    /// The most recently failed events, newest first.
    pub async fn failed_events(&self, limit: usize) -> Result<Vec<FailedEvent>, QueueError> {
        if limit == 0 {
            return Ok(vec![]);
        }
        let stop = isize::try_from(limit).unwrap_or(isize::MAX) - 1;
        let raws = self
            .client
            .lrange(self.keys.failed.clone(), 0, stop)
            .await?;

        Ok(raws
            .iter()
            .filter_map(|raw| serde_json::from_str(raw).ok())
            .collect())
    }

    async fn failed_entries(&self) -> Result<Vec<(String, FailedEvent)>, QueueError> {
        let raws = self.client.lrange(self.keys.failed.clone(), 0, -1).await?;

        Ok(raws
            .into_iter()
            .filter_map(|raw| {
                let failed = serde_json::from_str(&raw).ok()?;
                Some((raw, failed))
            })
            .collect())
    }

    async fn requeue(&self, raw: String, failed: FailedEvent) -> Result<bool, QueueError> {
        let mut event = failed.event;
        event.retries += 1;
        let event_id = event.id;

        let moved = self
            .client
            .lrem_lpush(
                self.keys.failed.clone(),
                raw,
                self.keys.pending.clone(),
                serde_json::to_string(&event)?,
            )
            .await?;

        if moved {
            debug!(event_id = %event_id, retries = event.retries, "re-enqueued failed event");
            metrics::counter!(EVENTS_RETRIED).increment(1);
        }
        Ok(moved)
    }
}
