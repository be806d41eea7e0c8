use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{ProfileStore, StoreError};
use crate::identifiers::{IdentifierKind, IdentifierSet};
use crate::types::{
    CustomerProfile, ManualMergeEntry, ManualMergeStatus, MergePlan, MergeRecord, NewProfile,
    NewRawEvent, ProfileStatistics, RawEvent,
};

#[derive(Default)]
struct MemoryState {
    profiles: HashMap<Uuid, CustomerProfile>,
    events: Vec<RawEvent>,
    merges: Vec<MergeRecord>,
    manual_merges: Vec<ManualMergeEntry>,
    /// A profile to delete once `get_profiles` has been called this many
    /// more times.
    removal_after_reads: Option<(Uuid, usize)>,
}

impl MemoryState {
    fn profile(&self, tenant_id: &str, id: Uuid) -> Option<&CustomerProfile> {
        self.profiles
            .get(&id)
            .filter(|profile| profile.tenant_id == tenant_id)
    }

    fn profile_mut(&mut self, tenant_id: &str, id: Uuid) -> Option<&mut CustomerProfile> {
        self.profiles
            .get_mut(&id)
            .filter(|profile| profile.tenant_id == tenant_id)
    }
}

/// In-memory `ProfileStore` for tests and local runs. Every operation holds
/// one lock for its whole duration, so multi-step writes are atomic.
#[derive(Default)]
pub struct MemoryProfileStore {
    state: Mutex<MemoryState>,
    create_conflicts: AtomicUsize,
    merge_failures: AtomicUsize,
    attach_misses: AtomicUsize,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fully specified profile, bypassing `create_profile`.
    pub async fn seed_profile(&self, profile: CustomerProfile) {
        self.state
            .lock()
            .await
            .profiles
            .insert(profile.id, profile);
    }

    /// Make the next `count` calls to `create_profile` fail with a conflict.
    pub fn fail_next_creates(&self, count: usize) {
        self.create_conflicts.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` calls to `apply_merge` fail without writing.
    pub fn fail_next_merges(&self, count: usize) {
        self.merge_failures.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` calls to `attach_event` fail as if the profile
    /// had been merged away.
    pub fn fail_next_attaches(&self, count: usize) {
        self.attach_misses.store(count, Ordering::SeqCst);
    }

    /// Delete profile `id` right after the `reads`-th following call to
    /// `get_profiles` returns, the way a concurrent merge would.
    pub async fn remove_after_reads(&self, id: Uuid, reads: usize) {
        self.state.lock().await.removal_after_reads = Some((id, reads));
    }

    pub async fn profile_count(&self, tenant_id: &str) -> usize {
        self.state
            .lock()
            .await
            .profiles
            .values()
            .filter(|profile| profile.tenant_id == tenant_id)
            .count()
    }

    pub async fn raw_event(&self, id: Uuid) -> Option<RawEvent> {
        self.state
            .lock()
            .await
            .events
            .iter()
            .find(|event| event.id == id)
            .cloned()
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn find_profile_ids(
        &self,
        tenant_id: &str,
        kind: IdentifierKind,
        value: &str,
    ) -> Result<Vec<Uuid>, StoreError> {
        let state = self.state.lock().await;
        let mut matches: Vec<&CustomerProfile> = state
            .profiles
            .values()
            .filter(|profile| profile.tenant_id == tenant_id)
            .filter(|profile| profile.identifiers.get(kind) == Some(value))
            .collect();
        matches.sort_by_key(|profile| (profile.created_at, profile.id));

        Ok(matches.into_iter().map(|profile| profile.id).collect())
    }

    async fn get_profile(&self, tenant_id: &str, id: Uuid) -> Result<CustomerProfile, StoreError> {
        self.state
            .lock()
            .await
            .profile(tenant_id, id)
            .cloned()
            .ok_or_else(|| StoreError::profile_not_found(id))
    }

    async fn get_profiles(
        &self,
        tenant_id: &str,
        ids: &[Uuid],
    ) -> Result<Vec<CustomerProfile>, StoreError> {
        let mut state = self.state.lock().await;
        let found: Vec<CustomerProfile> = ids
            .iter()
            .filter_map(|id| state.profile(tenant_id, *id).cloned())
            .collect();

        if let Some((id, reads)) = state.removal_after_reads {
            if reads <= 1 {
                state.profiles.remove(&id);
                state.removal_after_reads = None;
            } else {
                state.removal_after_reads = Some((id, reads - 1));
            }
        }
        Ok(found)
    }

    async fn create_profile(&self, profile: NewProfile) -> Result<CustomerProfile, StoreError> {
        if Self::take_failure(&self.create_conflicts) {
            return Err(StoreError::Conflict(
                "duplicate key value violates unique constraint".to_string(),
            ));
        }

        let now = Utc::now();
        let created = CustomerProfile {
            id: Uuid::now_v7(),
            profile_strength: profile.profile_strength(),
            tenant_id: profile.tenant_id,
            identifiers: profile.identifiers,
            lifetime_value: 0.0,
            total_orders: 0,
            created_at: now,
            updated_at: now,
        };

        self.state
            .lock()
            .await
            .profiles
            .insert(created.id, created.clone());
        Ok(created)
    }

    async fn add_identifiers(
        &self,
        tenant_id: &str,
        id: Uuid,
        identifiers: &IdentifierSet,
    ) -> Result<CustomerProfile, StoreError> {
        let mut state = self.state.lock().await;
        let profile = state
            .profile_mut(tenant_id, id)
            .ok_or_else(|| StoreError::profile_not_found(id))?;

        profile.identifiers.absorb(identifiers);
        profile.profile_strength = i16::from(profile.identifiers.strength());
        profile.updated_at = Utc::now();
        Ok(profile.clone())
    }

    async fn insert_raw_event(&self, event: NewRawEvent) -> Result<RawEvent, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.events.iter().find(|e| e.id == event.id) {
            if existing.tenant_id != event.tenant_id {
                return Err(StoreError::Conflict(format!(
                    "raw event {} belongs to another tenant",
                    event.id
                )));
            }
            return Ok(existing.clone());
        }

        let stored = RawEvent {
            id: event.id,
            tenant_id: event.tenant_id,
            event_type: event.event_type,
            payload: event.payload,
            profile_id: event.profile_id,
            created_at: Utc::now(),
        };
        state.events.push(stored.clone());
        Ok(stored)
    }

    async fn attach_event(
        &self,
        tenant_id: &str,
        event_id: Uuid,
        profile_id: Uuid,
    ) -> Result<bool, StoreError> {
        if Self::take_failure(&self.attach_misses) {
            return Err(StoreError::profile_not_found(profile_id));
        }

        let mut state = self.state.lock().await;
        let Some(index) = state
            .events
            .iter()
            .position(|e| e.id == event_id && e.tenant_id == tenant_id && e.profile_id.is_none())
        else {
            return Ok(false);
        };

        if state.profile(tenant_id, profile_id).is_none() {
            return Err(StoreError::profile_not_found(profile_id));
        }
        state.events[index].profile_id = Some(profile_id);
        Ok(true)
    }

    async fn apply_merge(
        &self,
        plan: MergePlan,
    ) -> Result<(CustomerProfile, MergeRecord), StoreError> {
        if Self::take_failure(&self.merge_failures) {
            return Err(StoreError::Database {
                command: "apply_merge".to_string(),
                error: sqlx::Error::PoolTimedOut,
            });
        }

        let mut state = self.state.lock().await;

        // Validate everything before writing anything
        for id in std::iter::once(&plan.base_id).chain(plan.loser_ids.iter()) {
            if state.profile(&plan.tenant_id, *id).is_none() {
                return Err(StoreError::profile_not_found(*id));
            }
        }

        let base = state
            .profile_mut(&plan.tenant_id, plan.base_id)
            .ok_or_else(|| StoreError::profile_not_found(plan.base_id))?;
        base.identifiers = plan.identifiers;
        base.profile_strength = plan.profile_strength;
        base.lifetime_value = plan.lifetime_value;
        base.total_orders = plan.total_orders;
        base.updated_at = Utc::now();
        let base = base.clone();

        for event in state.events.iter_mut() {
            if event.tenant_id == plan.tenant_id
                && event
                    .profile_id
                    .is_some_and(|id| plan.loser_ids.contains(&id))
            {
                event.profile_id = Some(plan.base_id);
            }
        }

        for id in &plan.loser_ids {
            state.profiles.remove(id);
        }

        let record = MergeRecord {
            id: Uuid::now_v7(),
            tenant_id: plan.tenant_id,
            base_profile_id: plan.base_id,
            merged_profile_ids: plan.loser_ids,
            reason: plan.reason,
            before: plan.before,
            after: base.snapshot(),
            created_at: Utc::now(),
        };
        state.merges.push(record.clone());

        Ok((base, record))
    }

    async fn create_manual_merge(
        &self,
        tenant_id: &str,
        profile_ids: &[Uuid],
        reason: &str,
    ) -> Result<ManualMergeEntry, StoreError> {
        let entry = ManualMergeEntry {
            id: Uuid::now_v7(),
            tenant_id: tenant_id.to_owned(),
            profile_ids: profile_ids.to_vec(),
            reason: reason.to_owned(),
            status: ManualMergeStatus::Pending,
            created_at: Utc::now(),
            resolved_at: None,
        };
        self.state.lock().await.manual_merges.push(entry.clone());
        Ok(entry)
    }

    async fn list_manual_merges(
        &self,
        tenant_id: &str,
        status: Option<ManualMergeStatus>,
    ) -> Result<Vec<ManualMergeEntry>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .manual_merges
            .iter()
            .filter(|entry| entry.tenant_id == tenant_id)
            .filter(|entry| status.is_none_or(|s| entry.status == s))
            .cloned()
            .collect())
    }

    async fn resolve_manual_merge(
        &self,
        tenant_id: &str,
        id: Uuid,
    ) -> Result<ManualMergeEntry, StoreError> {
        let mut state = self.state.lock().await;
        let entry = state
            .manual_merges
            .iter_mut()
            .find(|entry| entry.id == id && entry.tenant_id == tenant_id)
            .ok_or(StoreError::NotFound {
                entity: "manual merge",
                id,
            })?;

        entry.status = ManualMergeStatus::Resolved;
        entry.resolved_at.get_or_insert_with(Utc::now);
        Ok(entry.clone())
    }

    async fn merge_history(
        &self,
        tenant_id: &str,
        profile_id: Uuid,
    ) -> Result<Vec<MergeRecord>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .merges
            .iter()
            .rev()
            .filter(|record| record.tenant_id == tenant_id)
            .filter(|record| {
                record.base_profile_id == profile_id
                    || record.merged_profile_ids.contains(&profile_id)
            })
            .cloned()
            .collect())
    }

    async fn events_for_profile(
        &self,
        tenant_id: &str,
        profile_id: Uuid,
    ) -> Result<Vec<RawEvent>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .events
            .iter()
            .filter(|event| event.tenant_id == tenant_id && event.profile_id == Some(profile_id))
            .cloned()
            .collect())
    }

    async fn recompute_statistics(
        &self,
        tenant_id: &str,
        profile_id: Uuid,
    ) -> Result<CustomerProfile, StoreError> {
        let mut state = self.state.lock().await;
        let stats = ProfileStatistics::from_events(
            state
                .events
                .iter()
                .filter(|e| e.tenant_id == tenant_id && e.profile_id == Some(profile_id)),
        );

        let profile = state
            .profile_mut(tenant_id, profile_id)
            .ok_or_else(|| StoreError::profile_not_found(profile_id))?;
        profile.lifetime_value = stats.lifetime_value;
        profile.total_orders = stats.total_orders;
        profile.updated_at = Utc::now();
        Ok(profile.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn phone(value: &str) -> IdentifierSet {
        [(IdentifierKind::Phone, value.to_string())]
            .into_iter()
            .collect()
    }

    #[tokio::test]
    async fn test_profiles_are_isolated_by_tenant() {
        let store = MemoryProfileStore::new();
        let profile = store
            .create_profile(NewProfile::new("T1", phone("5551234567")))
            .await
            .unwrap();

        assert!(store
            .find_profile_ids("T2", IdentifierKind::Phone, "5551234567")
            .await
            .unwrap()
            .is_empty());
        assert!(store
            .get_profile("T2", profile.id)
            .await
            .unwrap_err()
            .is_not_found());
        assert_eq!(
            store
                .find_profile_ids("T1", IdentifierKind::Phone, "5551234567")
                .await
                .unwrap(),
            vec![profile.id]
        );
    }

    #[tokio::test]
    async fn test_attach_event_only_backfills_once() {
        let store = MemoryProfileStore::new();
        let event = store
            .insert_raw_event(NewRawEvent {
                id: Uuid::now_v7(),
                tenant_id: "T1".to_string(),
                event_type: "visit".to_string(),
                payload: json!({}),
                profile_id: None,
            })
            .await
            .unwrap();
        let first = store
            .create_profile(NewProfile::new("T1", phone("5551234567")))
            .await
            .unwrap()
            .id;
        let second = store
            .create_profile(NewProfile::new("T1", phone("5559876543")))
            .await
            .unwrap()
            .id;

        let err = store
            .attach_event("T1", event.id, Uuid::now_v7())
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        assert!(store.attach_event("T1", event.id, first).await.unwrap());
        assert!(!store.attach_event("T1", event.id, second).await.unwrap());
        assert_eq!(
            store.raw_event(event.id).await.unwrap().profile_id,
            Some(first)
        );
    }

    #[tokio::test]
    async fn test_apply_merge_fails_atomically_when_a_loser_is_gone() {
        let store = MemoryProfileStore::new();
        let base = store
            .create_profile(NewProfile::new("T1", phone("5551234567")))
            .await
            .unwrap();
        let gone = Uuid::now_v7();

        let err = store
            .apply_merge(MergePlan {
                tenant_id: "T1".to_string(),
                base_id: base.id,
                loser_ids: vec![gone],
                identifiers: IdentifierSet::new(),
                profile_strength: 0,
                lifetime_value: 99.0,
                total_orders: 9,
                reason: "test".to_string(),
                before: vec![],
            })
            .await
            .unwrap_err();

        assert!(err.is_not_found());
        let unchanged = store.get_profile("T1", base.id).await.unwrap();
        assert_eq!(unchanged, base);
    }

    #[tokio::test]
    async fn test_recompute_statistics_from_purchase_events() {
        let store = MemoryProfileStore::new();
        let profile = store
            .create_profile(NewProfile::new("T1", phone("5551234567")))
            .await
            .unwrap();
        for (event_type, payload) in [
            ("purchase", json!({ "total": "19.99" })),
            ("pos_purchase", json!({ "amount": 0.01 })),
            ("visit", json!({ "total": 500 })),
        ] {
            store
                .insert_raw_event(NewRawEvent {
                    id: Uuid::now_v7(),
                    tenant_id: "T1".to_string(),
                    event_type: event_type.to_string(),
                    payload,
                    profile_id: Some(profile.id),
                })
                .await
                .unwrap();
        }

        let updated = store.recompute_statistics("T1", profile.id).await.unwrap();

        assert_eq!(updated.total_orders, 2);
        assert!((updated.lifetime_value - 20.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_resolve_manual_merge_is_tenant_scoped() {
        let store = MemoryProfileStore::new();
        let entry = store
            .create_manual_merge("T1", &[Uuid::now_v7()], "review")
            .await
            .unwrap();

        assert!(store
            .resolve_manual_merge("T2", entry.id)
            .await
            .unwrap_err()
            .is_not_found());

        let resolved = store.resolve_manual_merge("T1", entry.id).await.unwrap();
        assert_eq!(resolved.status, ManualMergeStatus::Resolved);
        assert!(store
            .list_manual_merges("T1", Some(ManualMergeStatus::Pending))
            .await
            .unwrap()
            .is_empty());
        assert_eq!(store.list_manual_merges("T1", None).await.unwrap().len(), 1);
    }
}
