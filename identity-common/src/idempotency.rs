//! # Idempotency
//!
//! Suppresses duplicate processing of externally identified transactions
//! (webhook redeliveries, POS retries) within a TTL window.
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common_redis::{Client, CustomRedisError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

pub const IDEMPOTENCY_PREFIX: &str = "idempotency:";
pub const DEFAULT_IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const RESERVED: &str = "processing";

#[derive(Error, Debug)]
pub enum IdempotencyError {
    #[error(transparent)]
    Redis(#[from] CustomRedisError),
    #[error("could not serialize processed metadata: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// An external transaction reference carried by a source event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalTransaction {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<String>,
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl ExternalTransaction {
    /// Find the transaction reference in a source payload: `transaction_id` or
    /// `order_id`, plus `order_number` or `number` when present.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        let id = ["transaction_id", "order_id"]
            .iter()
            .find_map(|field| payload.get(*field).and_then(text))?;
        let number = ["order_number", "number"]
            .iter()
            .find_map(|field| payload.get(*field).and_then(text));

        Some(Self { id, number })
    }
}

/// The Redis key guarding one external transaction of one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn new(tenant_id: &str, transaction_id: &str, transaction_number: Option<&str>) -> Self {
        match transaction_number {
            Some(number) => Self(format!(
                "{IDEMPOTENCY_PREFIX}{tenant_id}:{transaction_id}:{number}"
            )),
            None => Self(format!("{IDEMPOTENCY_PREFIX}{tenant_id}:{transaction_id}")),
        }
    }

    pub fn for_transaction(tenant_id: &str, transaction: &ExternalTransaction) -> Self {
        Self::new(tenant_id, &transaction.id, transaction.number.as_deref())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    /// True if this caller made the reservation and should process the
    /// transaction; false if it was already reserved or processed.
    pub is_new: bool,
}

/// What was recorded once a transaction finished processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedMetadata {
    pub event_id: Uuid,
    pub profile_id: Option<Uuid>,
    pub processed_at: DateTime<Utc>,
}

pub struct IdempotencyGuard {
    client: Arc<dyn Client + Send + Sync>,
    ttl: Duration,
}

impl IdempotencyGuard {
    pub fn new(client: Arc<dyn Client + Send + Sync>, ttl: Duration) -> Self {
        Self { client, ttl }
    }

    fn ttl_secs(&self) -> u64 {
        self.ttl.as_secs().max(1)
    }

    /// Atomically reserve `key`. Only the first caller within the TTL window
    /// gets `is_new == true`.
    pub async fn check_and_reserve(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Reservation, IdempotencyError> {
        let is_new = self
            .client
            .set_nx_ex(key.0.clone(), RESERVED.to_string(), self.ttl_secs())
            .await?;
        Ok(Reservation { is_new })
    }

    /// Replace the reservation with the processing result, restarting the TTL.
    pub async fn mark_processed(
        &self,
        key: &IdempotencyKey,
        metadata: &ProcessedMetadata,
    ) -> Result<(), IdempotencyError> {
        let value = serde_json::to_string(metadata)?;
        self.client
            .setex(key.0.clone(), value, self.ttl_secs())
            .await?;
        Ok(())
    }

    /// The recorded result, if the transaction finished processing.
    pub async fn metadata(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<ProcessedMetadata>, IdempotencyError> {
        let value = match self.client.get(key.0.clone()).await {
            Ok(value) => value,
            Err(CustomRedisError::NotFound) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if value == RESERVED {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&value)?))
    }

    /// Drop a reservation whose processing failed, so a redelivery is not
    /// mistaken for a duplicate. A processed record is left alone.
    pub async fn release(&self, key: &IdempotencyKey) -> Result<bool, IdempotencyError> {
        Ok(self
            .client
            .del_if_eq(key.0.clone(), RESERVED.to_string())
            .await?)
    }
}
