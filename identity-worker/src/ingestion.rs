//! # Ingestion
//!
//! Resolves each incoming event to the canonical profile of its customer:
//! extract identifiers, find the profiles they belong to, then create, enrich
//! or merge. The raw event is stored first so a failure after that point is
//! retried without duplicating it.
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use identity_common::idempotency::{
    ExternalTransaction, IdempotencyGuard, IdempotencyKey, ProcessedMetadata,
};
use identity_common::identifiers::{IdentifiedPayload, IdentifierSet};
use identity_common::metrics_consts::{
    DUPLICATE_EVENTS, EVENTS_INGESTED, INGEST_DURATION, PROFILES_CREATED, PUBLISH_FAILURES,
};
use identity_common::queue::QueuedEvent;
use identity_common::store::{ProfileStore, StoreError};
use identity_common::types::{CustomerProfile, NewProfile, NewRawEvent, RawEvent};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{IngestError, PublishError};
use crate::matcher::ProfileMatcher;
use crate::merge::{MergeEngine, MergeOutcome};
use crate::publisher::{EventPublisher, MergeRequest, NormalizedEvent};

const MERGE_REASON: &str = "identifier_match";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestResult {
    pub event_id: Uuid,
    /// `None` only when profile creation lost a race at the store.
    pub profile_id: Option<Uuid>,
    pub profile_created: bool,
    pub profiles_merged: bool,
    pub requires_manual_review: bool,
}

/// One event to ingest, with a caller-chosen id so redeliveries of the same
/// event store a single raw event.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestRequest {
    pub event_id: Uuid,
    pub tenant_id: String,
    pub event_type: String,
    pub payload: Value,
    pub external_transaction: Option<ExternalTransaction>,
}

impl IngestRequest {
    pub fn new(tenant_id: &str, event_type: &str, payload: Value) -> Self {
        Self {
            event_id: Uuid::now_v7(),
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

impl From<QueuedEvent> for IngestRequest {
    fn from(event: QueuedEvent) -> Self {
        Self {
            event_id: event.id,
            tenant_id: event.tenant_id,
            event_type: event.event_type,
            payload: event.payload,
            external_transaction: event.external_transaction,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Ingested(IngestResult),
    /// The external transaction was already reserved or processed.
    Duplicate { key: IdempotencyKey },
}

#[derive(Debug, Default)]
struct Resolution {
    profile_id: Option<Uuid>,
    created: Option<CustomerProfile>,
    merge_request: Option<MergeRequest>,
    profiles_merged: bool,
}

impl Resolution {
    fn existing(profile_id: Uuid) -> Self {
        Self {
            profile_id: Some(profile_id),
            ..Default::default()
        }
    }
}

/// Everything published for one ingested event.
struct Notifications {
    raw: RawEvent,
    normalized: NormalizedEvent,
    merge_request: Option<MergeRequest>,
    created: Option<CustomerProfile>,
}

pub struct IngestionService {
    store: Arc<dyn ProfileStore>,
    matcher: ProfileMatcher,
    merger: MergeEngine,
    idempotency: IdempotencyGuard,
    publisher: Arc<dyn EventPublisher>,
}

impl IngestionService {
    pub fn new(
        store: Arc<dyn ProfileStore>,
        merger: MergeEngine,
        idempotency: IdempotencyGuard,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            matcher: ProfileMatcher::new(store.clone()),
            store,
            merger,
            idempotency,
            publisher,
        }
    }

    /// Ingest one event and resolve it to a profile.
    pub async fn ingest(
        &self,
        tenant_id: &str,
        event_type: &str,
        payload: Value,
    ) -> Result<IngestResult, IngestError> {
        self.process(IngestRequest::new(tenant_id, event_type, payload))
            .await
    }

    /// Ingest an event, suppressing it if its external transaction was already
    /// seen. A failed ingestion drops its reservation so a retry can proceed.
    pub async fn ingest_event(&self, request: IngestRequest) -> Result<IngestOutcome, IngestError> {
        let key = request
            .external_transaction
            .as_ref()
            .map(|transaction| IdempotencyKey::for_transaction(&request.tenant_id, transaction));
        let Some(key) = key else {
            return Ok(IngestOutcome::Ingested(self.process(request).await?));
        };

        if !self.idempotency.check_and_reserve(&key).await?.is_new {
            metrics::counter!(DUPLICATE_EVENTS).increment(1);
            info!(%key, event_id = %request.event_id, "skipping duplicate transaction");
            return Ok(IngestOutcome::Duplicate { key });
        }

        match self.process(request).await {
            Ok(result) => {
                let metadata = ProcessedMetadata {
                    event_id: result.event_id,
                    profile_id: result.profile_id,
                    processed_at: Utc::now(),
                };
                if let Err(e) = self.idempotency.mark_processed(&key, &metadata).await {
                    warn!(%key, "failed to record processed transaction: {}", e);
                }
                Ok(IngestOutcome::Ingested(result))
            }
            Err(e) => {
                if let Err(release_error) = self.idempotency.release(&key).await {
                    warn!(%key, "failed to release reservation: {}", release_error);
                }
                Err(e)
            }
        }
    }

    async fn process(&self, request: IngestRequest) -> Result<IngestResult, IngestError> {
        let start = Instant::now();
        let IngestRequest {
            event_id,
            tenant_id,
            event_type,
            payload,
            ..
        } = request;
        let IdentifiedPayload {
            identifiers,
            passthrough,
        } = IdentifiedPayload::from_value(payload);

        let raw = self
            .store
            .insert_raw_event(NewRawEvent {
                id: event_id,
                tenant_id: tenant_id.clone(),
                event_type: event_type.clone(),
                payload: passthrough,
                profile_id: None,
            })
            .await?;

        let resolution = self.resolve_with_retry(&raw, &identifiers).await?;

        let result = IngestResult {
            event_id: raw.id,
            profile_id: resolution.profile_id,
            profile_created: resolution.created.is_some(),
            profiles_merged: resolution.profiles_merged,
            requires_manual_review: resolution
                .merge_request
                .as_ref()
                .is_some_and(|request| request.requires_manual_review),
        };

        metrics::counter!(EVENTS_INGESTED, "event_type" => event_type.clone()).increment(1);
        metrics::histogram!(INGEST_DURATION).record(start.elapsed().as_secs_f64());
        debug!(
            tenant_id,
            event_type,
            event_id = %result.event_id,
            profile_id = ?result.profile_id,
            created = result.profile_created,
            merged = result.profiles_merged,
            "ingested event"
        );

        self.spawn_notifications(Notifications {
            normalized: NormalizedEvent {
                event_id: raw.id,
                tenant_id: raw.tenant_id.clone(),
                event_type: raw.event_type.clone(),
                profile_id: resolution.profile_id,
                identifiers,
            },
            raw,
            merge_request: resolution.merge_request,
            created: resolution.created,
        });

        Ok(result)
    }

    /// Resolve and attach, resolving once more if a profile was merged away
    /// underneath us.
    async fn resolve_with_retry(
        &self,
        raw: &RawEvent,
        identifiers: &IdentifierSet,
    ) -> Result<Resolution, IngestError> {
        let mut retried = false;
        loop {
            match self.resolve_and_attach(raw, identifiers).await {
                Err(e) if e.is_not_found() && !retried => {
                    debug!(event_id = %raw.id, "profile disappeared during resolution, retrying: {}", e);
                    retried = true;
                }
                result => return result,
            }
        }
    }

    async fn resolve_and_attach(
        &self,
        raw: &RawEvent,
        identifiers: &IdentifierSet,
    ) -> Result<Resolution, IngestError> {
        let resolution = self
            .resolve(&raw.tenant_id, &raw.event_type, identifiers)
            .await?;

        if let Some(profile_id) = resolution.profile_id {
            self.store
                .attach_event(&raw.tenant_id, raw.id, profile_id)
                .await?;
        }
        Ok(resolution)
    }

    async fn resolve(
        &self,
        tenant_id: &str,
        event_type: &str,
        identifiers: &IdentifierSet,
    ) -> Result<Resolution, IngestError> {
        let matches = self.matcher.find_matches(tenant_id, identifiers).await?;

        match matches.as_slice() {
            [] => self.create_profile(tenant_id, identifiers).await,
            [profile_id] => {
                self.add_missing_identifiers(tenant_id, *profile_id, identifiers)
                    .await?;
                Ok(Resolution::existing(*profile_id))
            }
            candidates => {
                let outcome = self
                    .merger
                    .merge(tenant_id, candidates, MERGE_REASON)
                    .await?;
                let profile_id = outcome.canonical_id();

                match &outcome {
                    MergeOutcome::Merged { .. } | MergeOutcome::AlreadyMerged { .. } => {
                        self.add_missing_identifiers(tenant_id, profile_id, identifiers)
                            .await?;
                    }
                    MergeOutcome::ManualReview { .. } => {
                        warn!(tenant_id, event_type, candidates = candidates.len(), "manual review required");
                    }
                    MergeOutcome::LockUnavailable { .. } => {}
                }

                let profiles_merged = matches!(outcome, MergeOutcome::Merged { .. });
                let merge_request = (profiles_merged || outcome.requires_manual_review()).then(
                    || MergeRequest {
                        tenant_id: tenant_id.to_owned(),
                        profile_ids: candidates.to_vec(),
                        reason: MERGE_REASON.to_owned(),
                        requires_manual_review: outcome.requires_manual_review(),
                    },
                );

                Ok(Resolution {
                    profile_id: Some(profile_id),
                    created: None,
                    merge_request,
                    profiles_merged,
                })
            }
        }
    }

    async fn create_profile(
        &self,
        tenant_id: &str,
        identifiers: &IdentifierSet,
    ) -> Result<Resolution, IngestError> {
        match self
            .store
            .create_profile(NewProfile::new(tenant_id, identifiers.clone()))
            .await
        {
            Ok(profile) => {
                metrics::counter!(PROFILES_CREATED).increment(1);
                info!(tenant_id, profile_id = %profile.id, strength = profile.profile_strength, "created profile");
                Ok(Resolution {
                    profile_id: Some(profile.id),
                    created: Some(profile),
                    ..Default::default()
                })
            }
            Err(StoreError::Conflict(message)) => {
                warn!(tenant_id, "profile creation conflicted, storing event without a profile: {}", message);
                Ok(Resolution::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Single-row update adding kinds the profile lacks. No lock is taken.
    async fn add_missing_identifiers(
        &self,
        tenant_id: &str,
        profile_id: Uuid,
        identifiers: &IdentifierSet,
    ) -> Result<(), IngestError> {
        if identifiers.is_empty() {
            return Ok(());
        }

        let profile = self.store.get_profile(tenant_id, profile_id).await?;
        let missing = profile.identifiers.missing_from(identifiers);
        if !missing.is_empty() {
            self.store
                .add_identifiers(tenant_id, profile_id, &missing)
                .await?;
            debug!(tenant_id, %profile_id, added = missing.len(), "added identifiers to profile");
        }
        Ok(())
    }

    fn spawn_notifications(&self, notifications: Notifications) {
        let publisher = self.publisher.clone();

        tokio::spawn(async move {
            let Notifications {
                raw,
                normalized,
                merge_request,
                created,
            } = notifications;

            report(publisher.publish_raw(&raw).await);
            report(publisher.publish_normalized(&normalized).await);
            if let Some(request) = merge_request {
                report(publisher.publish_merge_request(&request).await);
            }
            if let Some(profile) = created {
                report(publisher.publish_new_customer(&profile).await);
            }
        });
    }
}

fn report(result: Result<(), PublishError>) {
    if let Err(e) = result {
        metrics::counter!(PUBLISH_FAILURES).increment(1);
        warn!("failed to publish notification: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common_redis::MockRedisClient;
    use identity_common::idempotency::DEFAULT_IDEMPOTENCY_TTL;
    use identity_common::identifiers::IdentifierKind;
    use identity_common::lock::{RedisLockService, DEFAULT_MERGE_LOCK_TTL};
    use identity_common::store::MemoryProfileStore;
    use serde_json::json;

    use crate::merge::MergeConfig;
    use crate::publisher::NoopPublisher;

    fn service(store: &Arc<MemoryProfileStore>, redis: &MockRedisClient) -> IngestionService {
        let client = Arc::new(redis.clone());
        let merger = MergeEngine::new(
            store.clone(),
            Arc::new(RedisLockService::new(client.clone(), DEFAULT_MERGE_LOCK_TTL)),
            MergeConfig::default(),
        );
        IngestionService::new(
            store.clone(),
            merger,
            IdempotencyGuard::new(client, DEFAULT_IDEMPOTENCY_TTL),
            Arc::new(NoopPublisher),
        )
    }

    #[tokio::test]
    async fn test_first_sighting_creates_profile() {
        let store = Arc::new(MemoryProfileStore::new());
        let service = service(&store, &MockRedisClient::new());

        let result = service
            .ingest("T1", "visit", json!({ "phone": "+1 (555) 123-4567" }))
            .await
            .unwrap();

        assert!(result.profile_created);
        let profile_id = result.profile_id.unwrap();
        let profile = store.get_profile("T1", profile_id).await.unwrap();
        assert_eq!(profile.profile_strength, 20);
        assert_eq!(
            store.raw_event(result.event_id).await.unwrap().profile_id,
            Some(profile_id)
        );
    }

    #[tokio::test]
    async fn test_new_kinds_are_added_to_single_match() {
        let store = Arc::new(MemoryProfileStore::new());
        let service = service(&store, &MockRedisClient::new());

        let first = service
            .ingest("T1", "visit", json!({ "phone": "5551234567" }))
            .await
            .unwrap();
        let second = service
            .ingest(
                "T1",
                "purchase",
                json!({ "phone": "5551234567", "email": "A@X.com" }),
            )
            .await
            .unwrap();

        assert!(!second.profile_created);
        assert_eq!(second.profile_id, first.profile_id);
        let profile = store
            .get_profile("T1", first.profile_id.unwrap())
            .await
            .unwrap();
        assert_eq!(profile.identifiers.get(IdentifierKind::Email), Some("a@x.com"));
        assert_eq!(profile.profile_strength, 40);
    }

    #[tokio::test]
    async fn test_create_conflict_stores_event_without_profile() {
        let store = Arc::new(MemoryProfileStore::new());
        let service = service(&store, &MockRedisClient::new());
        store.fail_next_creates(1);

        let result = service
            .ingest("T1", "visit", json!({ "email": "a@x.com" }))
            .await
            .unwrap();

        assert_eq!(result.profile_id, None);
        assert!(!result.profile_created);
        let raw = store.raw_event(result.event_id).await.unwrap();
        assert_eq!(raw.profile_id, None);
    }

    #[tokio::test]
    async fn test_redelivered_event_is_stored_once() {
        let store = Arc::new(MemoryProfileStore::new());
        let service = service(&store, &MockRedisClient::new());
        let request = IngestRequest::new("T1", "visit", json!({ "email": "a@x.com" }));

        service.ingest_event(request.clone()).await.unwrap();
        service.ingest_event(request.clone()).await.unwrap();

        let profile_id = store
            .raw_event(request.event_id)
            .await
            .unwrap()
            .profile_id
            .unwrap();
        let events = store.events_for_profile("T1", profile_id).await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_transaction_is_skipped() {
        let store = Arc::new(MemoryProfileStore::new());
        let service = service(&store, &MockRedisClient::new());
        let payload = json!({ "order_id": 4501, "order_number": "1001", "email": "a@x.com" });
        let transaction = ExternalTransaction::from_payload(&payload).unwrap();

        let first = service
            .ingest_event(
                IngestRequest::new("T1", "order_paid", payload.clone())
                    .with_external_transaction(transaction.clone()),
            )
            .await
            .unwrap();
        let second = service
            .ingest_event(
                IngestRequest::new("T1", "order_paid", payload)
                    .with_external_transaction(transaction),
            )
            .await
            .unwrap();

        let IngestOutcome::Ingested(result) = first else {
            panic!("expected the first delivery to be ingested");
        };
        assert_eq!(
            second,
            IngestOutcome::Duplicate {
                key: IdempotencyKey::new("T1", "4501", Some("1001"))
            }
        );
        assert_eq!(
            store
                .events_for_profile("T1", result.profile_id.unwrap())
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_failed_ingestion_releases_reservation() {
        let store = Arc::new(MemoryProfileStore::new());
        let service = service(&store, &MockRedisClient::new());
        let transaction = ExternalTransaction {
            id: "pos-1".to_string(),
            number: None,
        };
        let a = service
            .ingest("T1", "visit", json!({ "email": "a@x.com" }))
            .await
            .unwrap();
        let b = service
            .ingest("T1", "visit", json!({ "phone": "5551234567" }))
            .await
            .unwrap();
        assert_ne!(a.profile_id, b.profile_id);

        store.fail_next_merges(1);
        let request = IngestRequest::new(
            "T1",
            "pos_sale",
            json!({ "email": "a@x.com", "phone": "5551234567" }),
        )
        .with_external_transaction(transaction.clone());

        let err = service.ingest_event(request.clone()).await.unwrap_err();
        assert!(matches!(err, IngestError::Merge(_)));

        let retried = service.ingest_event(request).await.unwrap();
        let IngestOutcome::Ingested(result) = retried else {
            panic!("expected the retry to be ingested");
        };
        assert!(result.profiles_merged);
        assert_eq!(result.profile_id, a.profile_id);
    }

    async fn seed(
        store: &MemoryProfileStore,
        identifiers: &[(IdentifierKind, &str)],
        age_minutes: i64,
    ) -> Uuid {
        let identifiers: IdentifierSet = identifiers
            .iter()
            .map(|(kind, value)| (*kind, value.to_string()))
            .collect();
        let created_at = Utc::now() - chrono::Duration::minutes(age_minutes);
        let profile = CustomerProfile {
            id: Uuid::now_v7(),
            tenant_id: "T1".to_string(),
            profile_strength: i16::from(identifiers.strength()),
            identifiers,
            lifetime_value: 0.0,
            total_orders: 0,
            created_at,
            updated_at: created_at,
        };
        let id = profile.id;
        store.seed_profile(profile).await;
        id
    }

    #[tokio::test]
    async fn test_attach_to_vanished_profile_resolves_again() {
        let store = Arc::new(MemoryProfileStore::new());
        let service = service(&store, &MockRedisClient::new());
        let first = service
            .ingest("T1", "visit", json!({ "email": "a@x.com" }))
            .await
            .unwrap();
        store.fail_next_attaches(1);

        let second = service
            .ingest("T1", "purchase", json!({ "email": "a@x.com", "total": 12 }))
            .await
            .unwrap();

        assert_eq!(second.profile_id, first.profile_id);
        assert_eq!(
            store.raw_event(second.event_id).await.unwrap().profile_id,
            first.profile_id
        );
    }

    #[tokio::test]
    async fn test_attach_misses_twice_is_an_error() {
        let store = Arc::new(MemoryProfileStore::new());
        let service = service(&store, &MockRedisClient::new());
        service
            .ingest("T1", "visit", json!({ "email": "a@x.com" }))
            .await
            .unwrap();
        store.fail_next_attaches(2);

        let err = service
            .ingest("T1", "visit", json!({ "email": "a@x.com" }))
            .await
            .unwrap_err();

        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_merge_whose_base_vanished_resolves_again() {
        let store = Arc::new(MemoryProfileStore::new());
        let service = service(&store, &MockRedisClient::new());
        let a = seed(
            &store,
            &[
                (IdentifierKind::Email, "a@x.com"),
                (IdentifierKind::LoyaltyId, "LOY-1"),
            ],
            30,
        )
        .await;
        let b = seed(&store, &[(IdentifierKind::Phone, "15551234567")], 20).await;
        let c = seed(&store, &[(IdentifierKind::DeviceId, "dev-1")], 10).await;
        store.remove_after_reads(a, 1).await;

        let result = service
            .ingest(
                "T1",
                "visit",
                json!({ "email": "a@x.com", "phone": "15551234567", "device_id": "dev-1" }),
            )
            .await
            .unwrap();

        assert!(result.profiles_merged);
        assert_eq!(result.profile_id, Some(b));
        assert!(store.get_profile("T1", c).await.unwrap_err().is_not_found());
        let profile = store.get_profile("T1", b).await.unwrap();
        assert_eq!(profile.identifiers.get(IdentifierKind::Email), Some("a@x.com"));
        assert_eq!(profile.identifiers.get(IdentifierKind::DeviceId), Some("dev-1"));
    }

    #[tokio::test]
    async fn test_already_merged_candidates_attach_to_survivor() {
        let store = Arc::new(MemoryProfileStore::new());
        let service = service(&store, &MockRedisClient::new());
        let a = seed(&store, &[(IdentifierKind::Email, "a@x.com")], 20).await;
        let b = seed(&store, &[(IdentifierKind::Phone, "15551234567")], 10).await;
        store.remove_after_reads(b, 1).await;

        let result = service
            .ingest(
                "T1",
                "visit",
                json!({ "email": "a@x.com", "phone": "15551234567" }),
            )
            .await
            .unwrap();

        assert_eq!(result.profile_id, Some(a));
        assert!(!result.profiles_merged);
        assert!(!result.requires_manual_review);
        let profile = store.get_profile("T1", a).await.unwrap();
        assert_eq!(profile.identifiers.get(IdentifierKind::Phone), Some("15551234567"));
        assert_eq!(
            store.raw_event(result.event_id).await.unwrap().profile_id,
            Some(a)
        );
    }
}
