use std::sync::Arc;

use async_trait::async_trait;
use common_redis::Client;
use identity_common::identifiers::IdentifierSet;
use identity_common::types::{CustomerProfile, RawEvent};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PublishError;

pub const RAW_EVENTS_STREAM: &str = "events.raw";
pub const NORMALIZED_EVENTS_STREAM: &str = "events.normalized";
pub const MERGE_REQUESTS_STREAM: &str = "profiles.merge_requests";
pub const NEW_CUSTOMERS_STREAM: &str = "customers.new";

pub const DEFAULT_STREAM_MAX_LEN: usize = 10_000;
pub const DEFAULT_MERGE_STREAM_MAX_LEN: usize = 1_000;

/// An ingested event with its extracted identifiers and resolved profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub event_id: Uuid,
    pub tenant_id: String,
    pub event_type: String,
    pub profile_id: Option<Uuid>,
    pub identifiers: IdentifierSet,
}

/// Notification that a set of profiles was found to belong together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeRequest {
    pub tenant_id: String,
    pub profile_ids: Vec<Uuid>,
    pub reason: String,
    pub requires_manual_review: bool,
}

/// Downstream notifications emitted during ingestion. Failures are reported
/// but never affect the outcome of the ingestion that triggered them.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish_raw(&self, event: &RawEvent) -> Result<(), PublishError>;
    async fn publish_normalized(&self, event: &NormalizedEvent) -> Result<(), PublishError>;
    async fn publish_merge_request(&self, request: &MergeRequest) -> Result<(), PublishError>;
    async fn publish_new_customer(&self, profile: &CustomerProfile) -> Result<(), PublishError>;
}

/// Publishes to capped Redis streams.
pub struct RedisStreamPublisher {
    client: Arc<dyn Client + Send + Sync>,
    max_len: usize,
    merge_max_len: usize,
}

impl RedisStreamPublisher {
    pub fn new(client: Arc<dyn Client + Send + Sync>, max_len: usize, merge_max_len: usize) -> Self {
        Self {
            client,
            max_len,
            merge_max_len,
        }
    }

    async fn add(
        &self,
        stream: &'static str,
        max_len: usize,
        fields: Vec<(String, String)>,
    ) -> Result<(), PublishError> {
        self.client
            .xadd(stream.to_owned(), max_len, fields)
            .await
            .map_err(|error| PublishError::Redis { stream, error })?;
        Ok(())
    }
}

fn field(name: &str, value: impl ToString) -> (String, String) {
    (name.to_owned(), value.to_string())
}

#[async_trait]
impl EventPublisher for RedisStreamPublisher {
    async fn publish_raw(&self, event: &RawEvent) -> Result<(), PublishError> {
        let fields = vec![
            field("event_id", event.id),
            field("tenant_id", &event.tenant_id),
            field("event_type", &event.event_type),
            field("payload", serde_json::to_string(&event.payload)?),
            field("created_at", event.created_at.to_rfc3339()),
        ];
        self.add(RAW_EVENTS_STREAM, self.max_len, fields).await
    }

    async fn publish_normalized(&self, event: &NormalizedEvent) -> Result<(), PublishError> {
        let fields = vec![
            field("event_id", event.event_id),
            field("tenant_id", &event.tenant_id),
            field("event_type", &event.event_type),
            field(
                "profile_id",
                event.profile_id.map(|id| id.to_string()).unwrap_or_default(),
            ),
            field("identifiers", serde_json::to_string(&event.identifiers)?),
        ];
        self.add(NORMALIZED_EVENTS_STREAM, self.max_len, fields)
            .await
    }

    async fn publish_merge_request(&self, request: &MergeRequest) -> Result<(), PublishError> {
        let fields = vec![
            field("tenant_id", &request.tenant_id),
            field("profile_ids", serde_json::to_string(&request.profile_ids)?),
            field("reason", &request.reason),
            field("requires_manual_review", request.requires_manual_review),
        ];
        self.add(MERGE_REQUESTS_STREAM, self.merge_max_len, fields)
            .await
    }

    async fn publish_new_customer(&self, profile: &CustomerProfile) -> Result<(), PublishError> {
        let fields = vec![
            field("profile_id", profile.id),
            field("tenant_id", &profile.tenant_id),
            field("identifiers", serde_json::to_string(&profile.identifiers)?),
            field("profile_strength", profile.profile_strength),
            field("created_at", profile.created_at.to_rfc3339()),
        ];
        self.add(NEW_CUSTOMERS_STREAM, self.max_len, fields).await
    }
}

/// Drops every notification. Used when stream publishing is disabled.
pub struct NoopPublisher;

#[async_trait]
impl EventPublisher for NoopPublisher {
    async fn publish_raw(&self, _: &RawEvent) -> Result<(), PublishError> {
        Ok(())
    }

    async fn publish_normalized(&self, _: &NormalizedEvent) -> Result<(), PublishError> {
        Ok(())
    }

    async fn publish_merge_request(&self, _: &MergeRequest) -> Result<(), PublishError> {
        Ok(())
    }

    async fn publish_new_customer(&self, _: &CustomerProfile) -> Result<(), PublishError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common_redis::{CustomRedisError, MockRedisClient};
    use identity_common::identifiers::IdentifierKind;
    use serde_json::json;

    fn publisher(client: &MockRedisClient) -> RedisStreamPublisher {
        RedisStreamPublisher::new(Arc::new(client.clone()), 2, 1)
    }

    fn raw_event() -> RawEvent {
        RawEvent {
            id: Uuid::now_v7(),
            tenant_id: "T1".to_string(),
            event_type: "purchase".to_string(),
            payload: json!({ "total": 12.5 }),
            profile_id: None,
            created_at: Utc::now(),
        }
    }

    fn value<'a>(entry: &'a [(String, String)], name: &str) -> Option<&'a str> {
        entry
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    #[tokio::test]
    async fn test_raw_events_are_capped() {
        let client = MockRedisClient::new();
        let publisher = publisher(&client);

        for _ in 0..3 {
            publisher.publish_raw(&raw_event()).await.unwrap();
        }

        let entries = client.stream(RAW_EVENTS_STREAM);
        assert_eq!(entries.len(), 2);
        assert_eq!(value(&entries[0], "tenant_id"), Some("T1"));
        assert_eq!(value(&entries[0], "payload"), Some(r#"{"total":12.5}"#));
    }

    #[tokio::test]
    async fn test_normalized_event_fields() {
        let client = MockRedisClient::new();
        let mut identifiers = IdentifierSet::new();
        identifiers.insert(IdentifierKind::Email, "a@x.com");
        let event = NormalizedEvent {
            event_id: Uuid::now_v7(),
            tenant_id: "T1".to_string(),
            event_type: "visit".to_string(),
            profile_id: None,
            identifiers,
        };

        publisher(&client).publish_normalized(&event).await.unwrap();

        let entries = client.stream(NORMALIZED_EVENTS_STREAM);
        assert_eq!(value(&entries[0], "profile_id"), Some(""));
        assert_eq!(
            value(&entries[0], "identifiers"),
            Some(r#"{"email":"a@x.com"}"#)
        );
    }

    #[tokio::test]
    async fn test_merge_requests_use_their_own_cap() {
        let client = MockRedisClient::new();
        let publisher = publisher(&client);
        let request = MergeRequest {
            tenant_id: "T1".to_string(),
            profile_ids: vec![Uuid::now_v7(), Uuid::now_v7()],
            reason: "shared phone".to_string(),
            requires_manual_review: true,
        };

        publisher.publish_merge_request(&request).await.unwrap();
        publisher.publish_merge_request(&request).await.unwrap();

        let entries = client.stream(MERGE_REQUESTS_STREAM);
        assert_eq!(entries.len(), 1);
        assert_eq!(value(&entries[0], "requires_manual_review"), Some("true"));
    }

    #[tokio::test]
    async fn test_redis_failures_name_the_stream() {
        let client = MockRedisClient::new().fail_op("xadd", CustomRedisError::Timeout);

        let err = publisher(&client)
            .publish_raw(&raw_event())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PublishError::Redis {
                stream: RAW_EVENTS_STREAM,
                ..
            }
        ));
    }
}
