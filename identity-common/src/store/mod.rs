//! # Store
//!
//! Persistence of profiles, raw events, merge history and the manual-merge
//! queue. All operations are scoped by tenant: a profile or event of another
//! tenant behaves exactly like one that does not exist.
use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::identifiers::{IdentifierKind, IdentifierSet};
use crate::types::{
    CustomerProfile, ManualMergeEntry, ManualMergeStatus, MergePlan, MergeRecord, NewProfile,
    NewRawEvent, RawEvent,
};

mod memory;
mod postgres;

pub use memory::MemoryProfileStore;
pub use postgres::PgProfileStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
    #[error("conflicting write: {0}")]
    Conflict(String),
    #[error("{command} query failed with: {error}")]
    Database { command: String, error: sqlx::Error },
    #[error("could not serialize {field}: {error}")]
    Serialization {
        field: &'static str,
        error: serde_json::Error,
    },
}

impl StoreError {
    pub fn profile_not_found(id: Uuid) -> Self {
        StoreError::NotFound {
            entity: "profile",
            id,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Ids of the tenant's profiles holding `value` for `kind`, oldest first.
    async fn find_profile_ids(
        &self,
        tenant_id: &str,
        kind: IdentifierKind,
        value: &str,
    ) -> Result<Vec<Uuid>, StoreError>;

    async fn get_profile(&self, tenant_id: &str, id: Uuid) -> Result<CustomerProfile, StoreError>;

    /// The profiles among `ids` that exist. Missing ids are skipped.
    async fn get_profiles(
        &self,
        tenant_id: &str,
        ids: &[Uuid],
    ) -> Result<Vec<CustomerProfile>, StoreError>;

    async fn create_profile(&self, profile: NewProfile) -> Result<CustomerProfile, StoreError>;

    /// Add the kinds of `identifiers` the profile does not have yet and
    /// recompute its strength. Existing values are kept.
    async fn add_identifiers(
        &self,
        tenant_id: &str,
        id: Uuid,
        identifiers: &IdentifierSet,
    ) -> Result<CustomerProfile, StoreError>;

    /// Store a raw event. Inserting an id that already exists returns the
    /// stored event unchanged, so redelivered events are not duplicated.
    async fn insert_raw_event(&self, event: NewRawEvent) -> Result<RawEvent, StoreError>;

    /// Backfill the profile of an event that has none. Returns whether the
    /// event was updated.
    async fn attach_event(
        &self,
        tenant_id: &str,
        event_id: Uuid,
        profile_id: Uuid,
    ) -> Result<bool, StoreError>;

    /// Atomically write the merged base profile, re-point the losers' events,
    /// record the merge and delete the losers.
    async fn apply_merge(&self, plan: MergePlan)
        -> Result<(CustomerProfile, MergeRecord), StoreError>;

    async fn create_manual_merge(
        &self,
        tenant_id: &str,
        profile_ids: &[Uuid],
        reason: &str,
    ) -> Result<ManualMergeEntry, StoreError>;

    async fn list_manual_merges(
        &self,
        tenant_id: &str,
        status: Option<ManualMergeStatus>,
    ) -> Result<Vec<ManualMergeEntry>, StoreError>;

    async fn resolve_manual_merge(
        &self,
        tenant_id: &str,
        id: Uuid,
    ) -> Result<ManualMergeEntry, StoreError>;

    /// Merges where `profile_id` was the base or one of the merged profiles,
    /// newest first.
    async fn merge_history(
        &self,
        tenant_id: &str,
        profile_id: Uuid,
    ) -> Result<Vec<MergeRecord>, StoreError>;

    async fn events_for_profile(
        &self,
        tenant_id: &str,
        profile_id: Uuid,
    ) -> Result<Vec<RawEvent>, StoreError>;

    /// Recalculate lifetime value and order count from the profile's purchase
    /// events and persist them.
    async fn recompute_statistics(
        &self,
        tenant_id: &str,
        profile_id: Uuid,
    ) -> Result<CustomerProfile, StoreError>;
}
