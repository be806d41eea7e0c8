use identity_common::identifiers::{normalize, IdentifierKind};
use identity_common::store::{MemoryProfileStore, ProfileStore};
use identity_common::types::{ManualMergeStatus, MergePlan, NewProfile, NewRawEvent};
use serde_json::{json, Value};
use uuid::Uuid;

async fn profile_with_purchase(
    store: &MemoryProfileStore,
    payload: Value,
    total: f64,
) -> Uuid {
    let profile = store
        .create_profile(NewProfile::new("T1", normalize(&payload)))
        .await
        .unwrap();
    let event = store
        .insert_raw_event(NewRawEvent {
            id: Uuid::now_v7(),
            tenant_id: "T1".to_string(),
            event_type: "order_paid".to_string(),
            payload: json!({ "total": total }),
            profile_id: Some(profile.id),
        })
        .await
        .unwrap();
    assert_eq!(event.profile_id, Some(profile.id));
    profile.id
}

#[tokio::test]
async fn test_merged_profile_statistics_can_be_recomputed() {
    let store = MemoryProfileStore::new();
    let base_id = profile_with_purchase(&store, json!({ "email": "a@x.com" }), 40.0).await;
    let loser_id = profile_with_purchase(&store, json!({ "phone": "5551234567" }), 2.5).await;
    let base = store.get_profile("T1", base_id).await.unwrap();
    let loser = store.get_profile("T1", loser_id).await.unwrap();

    let mut identifiers = base.identifiers.clone();
    identifiers.absorb(&loser.identifiers);
    let (merged, record) = store
        .apply_merge(MergePlan {
            tenant_id: "T1".to_string(),
            base_id,
            loser_ids: vec![loser_id],
            profile_strength: i16::from(identifiers.strength()),
            identifiers,
            // Deliberately inflated, as if the same order had been counted twice.
            lifetime_value: 85.0,
            total_orders: 3,
            reason: "identifier_match".to_string(),
            before: vec![base.snapshot(), loser.snapshot()],
        })
        .await
        .unwrap();
    assert_eq!(record.after.lifetime_value, 85.0);
    assert_eq!(merged.identifiers.get(IdentifierKind::Phone), Some("5551234567"));

    let events = store.events_for_profile("T1", base_id).await.unwrap();
    assert_eq!(events.len(), 2);

    let recomputed = store.recompute_statistics("T1", base_id).await.unwrap();
    assert_eq!(recomputed.lifetime_value, 42.5);
    assert_eq!(recomputed.total_orders, 2);
}

#[tokio::test]
async fn test_manual_merge_lifecycle() {
    let store = MemoryProfileStore::new();
    let ids = vec![Uuid::now_v7(), Uuid::now_v7(), Uuid::now_v7(), Uuid::now_v7()];

    let entry = store
        .create_manual_merge("T1", &ids, "Auto-merge blocked: 4 profiles exceed threshold of 3")
        .await
        .unwrap();
    assert_eq!(entry.status, ManualMergeStatus::Pending);

    let pending = store
        .list_manual_merges("T1", Some(ManualMergeStatus::Pending))
        .await
        .unwrap();
    assert_eq!(pending, vec![entry.clone()]);
    assert!(store
        .list_manual_merges("T2", None)
        .await
        .unwrap()
        .is_empty());

    let resolved = store.resolve_manual_merge("T1", entry.id).await.unwrap();
    assert_eq!(resolved.status, ManualMergeStatus::Resolved);
    assert!(resolved.resolved_at.is_some());
    assert!(store
        .list_manual_merges("T1", Some(ManualMergeStatus::Pending))
        .await
        .unwrap()
        .is_empty());

    let err = store
        .resolve_manual_merge("T2", entry.id)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_tenants_do_not_see_each_other() {
    let store = MemoryProfileStore::new();
    let profile = store
        .create_profile(NewProfile::new("T1", normalize(&json!({ "email": "a@x.com" }))))
        .await
        .unwrap();

    assert!(store
        .find_profile_ids("T2", IdentifierKind::Email, "a@x.com")
        .await
        .unwrap()
        .is_empty());
    assert!(store
        .get_profile("T2", profile.id)
        .await
        .unwrap_err()
        .is_not_found());
    assert!(store
        .get_profiles("T2", &[profile.id])
        .await
        .unwrap()
        .is_empty());
}
