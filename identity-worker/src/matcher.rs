use std::sync::Arc;

use identity_common::identifiers::{IdentifierKind, IdentifierSet};
use identity_common::store::{ProfileStore, StoreError};
use identity_common::types::CustomerProfile;
use uuid::Uuid;

/// Finds the existing profiles an identifier set belongs to.
#[derive(Clone)]
pub struct ProfileMatcher {
    store: Arc<dyn ProfileStore>,
}

impl ProfileMatcher {
    pub fn new(store: Arc<dyn ProfileStore>) -> Self {
        Self { store }
    }

    /// Every profile of the tenant sharing at least one identifier value with
    /// `identifiers`. Ids are deduplicated and ordered by the priority of the
    /// kind that first matched them.
    pub async fn find_matches(
        &self,
        tenant_id: &str,
        identifiers: &IdentifierSet,
    ) -> Result<Vec<Uuid>, StoreError> {
        let mut matches: Vec<Uuid> = Vec::new();

        for kind in IdentifierKind::ALL {
            let Some(value) = identifiers.get(kind) else {
                continue;
            };
            for id in self.store.find_profile_ids(tenant_id, kind, value).await? {
                if !matches.contains(&id) {
                    matches.push(id);
                }
            }
        }

        Ok(matches)
    }
}

pub fn profile_strength(identifiers: &IdentifierSet) -> u8 {
    identifiers.strength()
}

/// Order merge candidates so the base profile comes first: strongest, then
/// oldest, then lowest id.
pub fn select_base(candidates: &mut [CustomerProfile]) {
    candidates.sort_by(|a, b| {
        b.profile_strength
            .cmp(&a.profile_strength)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.id.cmp(&b.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use identity_common::store::MemoryProfileStore;
    use identity_common::types::NewProfile;

    fn ids(pairs: &[(IdentifierKind, &str)]) -> IdentifierSet {
        pairs
            .iter()
            .map(|(kind, value)| (*kind, value.to_string()))
            .collect()
    }

    fn profile(strength: i16, age_minutes: i64) -> CustomerProfile {
        let created_at = Utc::now() - Duration::minutes(age_minutes);
        CustomerProfile {
            id: Uuid::now_v7(),
            tenant_id: "T1".to_string(),
            identifiers: IdentifierSet::new(),
            profile_strength: strength,
            lifetime_value: 0.0,
            total_orders: 0,
            created_at,
            updated_at: created_at,
        }
    }

    #[tokio::test]
    async fn test_find_matches_unions_all_kinds() {
        let store = Arc::new(MemoryProfileStore::new());
        let by_phone = store
            .create_profile(NewProfile::new(
                "T1",
                ids(&[(IdentifierKind::Phone, "5551234567")]),
            ))
            .await
            .unwrap();
        let by_email = store
            .create_profile(NewProfile::new(
                "T1",
                ids(&[(IdentifierKind::Email, "a@x.com")]),
            ))
            .await
            .unwrap();
        let by_both = store
            .create_profile(NewProfile::new(
                "T1",
                ids(&[
                    (IdentifierKind::Phone, "5551234567"),
                    (IdentifierKind::Email, "a@x.com"),
                ]),
            ))
            .await
            .unwrap();
        store
            .create_profile(NewProfile::new(
                "T2",
                ids(&[(IdentifierKind::Phone, "5551234567")]),
            ))
            .await
            .unwrap();

        let matcher = ProfileMatcher::new(store);
        let matches = matcher
            .find_matches(
                "T1",
                &ids(&[
                    (IdentifierKind::Phone, "5551234567"),
                    (IdentifierKind::Email, "a@x.com"),
                ]),
            )
            .await
            .unwrap();

        assert_eq!(matches.len(), 3);
        assert_eq!(matches[0], by_phone.id);
        assert!(matches.contains(&by_email.id));
        assert!(matches.contains(&by_both.id));
    }

    #[tokio::test]
    async fn test_no_identifiers_match_nothing() {
        let store = Arc::new(MemoryProfileStore::new());
        store
            .create_profile(NewProfile::new("T1", IdentifierSet::new()))
            .await
            .unwrap();

        let matcher = ProfileMatcher::new(store);
        let matches = matcher
            .find_matches("T1", &IdentifierSet::new())
            .await
            .unwrap();

        assert!(matches.is_empty());
    }

    #[test]
    fn test_select_base_prefers_strength_then_age() {
        let weak_old = profile(40, 60);
        let strong_new = profile(80, 1);
        let strong_old = profile(80, 30);
        let mut candidates = vec![weak_old.clone(), strong_new.clone(), strong_old.clone()];

        select_base(&mut candidates);

        assert_eq!(
            candidates.iter().map(|p| p.id).collect::<Vec<_>>(),
            vec![strong_old.id, strong_new.id, weak_old.id]
        );
    }

    #[test]
    fn test_select_base_breaks_full_ties_by_id() {
        let mut first = profile(50, 10);
        let mut second = first.clone();
        first.id = Uuid::from_u128(1);
        second.id = Uuid::from_u128(2);
        let mut candidates = vec![second.clone(), first.clone()];

        select_base(&mut candidates);

        assert_eq!(candidates[0].id, first.id);
    }

    #[test]
    fn test_profile_strength_uses_identifier_weights() {
        assert_eq!(profile_strength(&IdentifierSet::new()), 0);
        assert_eq!(
            profile_strength(&ids(&[(IdentifierKind::Phone, "15551234567")])),
            20
        );
    }
}
