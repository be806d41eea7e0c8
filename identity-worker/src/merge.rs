//! # Merge
//!
//! Folds several profiles that turned out to be the same customer into one.
//! The base profile is chosen by strength, locked for the duration of the
//! merge, and the store applies the result in a single transaction. Merges
//! involving too many profiles are queued for a human instead.
use std::sync::Arc;

use identity_common::lock::{LockError, LockService};
use identity_common::metrics_consts::{
    MANUAL_MERGES_QUEUED, MERGE_LOCK_CONTENDED, MERGE_LOCK_RELEASE_FAILURES, PROFILES_MERGED,
};
use identity_common::store::{ProfileStore, StoreError};
use identity_common::types::{CustomerProfile, ManualMergeEntry, MergePlan, MergeRecord};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::MergeError;
use crate::matcher::{profile_strength, select_base};

pub const DEFAULT_MAX_AUTO_MERGE_PROFILES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeConfig {
    /// When disabled, merges of any size are applied without review.
    pub auto_merge_enabled: bool,
    /// Largest number of profiles merged without review.
    pub max_auto_merge_profiles: usize,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            auto_merge_enabled: true,
            max_auto_merge_profiles: DEFAULT_MAX_AUTO_MERGE_PROFILES,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// The candidates were folded into `profile`.
    Merged {
        profile: CustomerProfile,
        record: MergeRecord,
    },
    /// Too many candidates: a review entry was queued and nothing changed.
    /// `fallback` is the profile that would have been the base.
    ManualReview {
        entry: ManualMergeEntry,
        fallback: Uuid,
    },
    /// Someone else is merging into the same base right now.
    LockUnavailable { fallback: Uuid },
    /// A concurrent merge already left a single survivor.
    AlreadyMerged { profile_id: Uuid },
}

impl MergeOutcome {
    /// The profile an event resolved through this merge should attach to.
    pub fn canonical_id(&self) -> Uuid {
        match self {
            MergeOutcome::Merged { profile, .. } => profile.id,
            MergeOutcome::ManualReview { fallback, .. } => *fallback,
            MergeOutcome::LockUnavailable { fallback } => *fallback,
            MergeOutcome::AlreadyMerged { profile_id } => *profile_id,
        }
    }

    pub fn requires_manual_review(&self) -> bool {
        matches!(self, MergeOutcome::ManualReview { .. })
    }
}

pub struct MergeEngine {
    store: Arc<dyn ProfileStore>,
    locks: Arc<dyn LockService>,
    config: MergeConfig,
}

impl MergeEngine {
    pub fn new(
        store: Arc<dyn ProfileStore>,
        locks: Arc<dyn LockService>,
        config: MergeConfig,
    ) -> Self {
        Self {
            store,
            locks,
            config,
        }
    }

    /// Merge `candidate_ids` of `tenant_id` into a single profile.
    pub async fn merge(
        &self,
        tenant_id: &str,
        candidate_ids: &[Uuid],
        reason: &str,
    ) -> Result<MergeOutcome, MergeError> {
        let mut ids: Vec<Uuid> = Vec::with_capacity(candidate_ids.len());
        for id in candidate_ids {
            if !ids.contains(id) {
                ids.push(*id);
            }
        }
        if ids.len() < 2 {
            return Err(MergeError::InsufficientCandidates(ids.len()));
        }

        let mut candidates = self.store.get_profiles(tenant_id, &ids).await?;
        if candidates.len() < 2 {
            return Err(MergeError::NotFound {
                found: candidates.len(),
            });
        }
        select_base(&mut candidates);
        let base_id = candidates[0].id;

        let lock = match self.locks.acquire(base_id).await {
            Ok(lock) => lock,
            Err(LockError::AlreadyHeld(_)) => {
                metrics::counter!(MERGE_LOCK_CONTENDED).increment(1);
                info!(tenant_id, %base_id, "merge lock is held elsewhere, skipping merge");
                return Ok(MergeOutcome::LockUnavailable { fallback: base_id });
            }
            Err(e) => return Err(e.into()),
        };

        let result = self.merge_locked(tenant_id, base_id, &ids, reason).await;

        match self.locks.release(&lock).await {
            Ok(true) => {}
            Ok(false) => {
                metrics::counter!(MERGE_LOCK_RELEASE_FAILURES).increment(1);
                warn!(%base_id, "merge lock expired before it was released");
            }
            Err(e) => {
                metrics::counter!(MERGE_LOCK_RELEASE_FAILURES).increment(1);
                warn!(%base_id, "failed to release merge lock: {}", e);
            }
        }

        result
    }

    async fn merge_locked(
        &self,
        tenant_id: &str,
        base_id: Uuid,
        ids: &[Uuid],
        reason: &str,
    ) -> Result<MergeOutcome, MergeError> {
        // Candidates may have changed between the first read and taking the lock.
        let mut candidates = self.store.get_profiles(tenant_id, ids).await?;
        if candidates.len() < 2 {
            let profile_id = candidates.first().map_or(base_id, |p| p.id);
            debug!(tenant_id, %profile_id, "candidates were already merged");
            return Ok(MergeOutcome::AlreadyMerged { profile_id });
        }
        select_base(&mut candidates);
        if candidates[0].id != base_id {
            // The locked base was merged away by a merge with a different base.
            return Err(StoreError::profile_not_found(base_id).into());
        }

        let count = candidates.len();
        if self.config.auto_merge_enabled && count > self.config.max_auto_merge_profiles {
            let review_reason = format!(
                "Auto-merge blocked: {} profiles exceed threshold of {}",
                count, self.config.max_auto_merge_profiles
            );
            let candidate_ids: Vec<Uuid> = candidates.iter().map(|p| p.id).collect();
            let entry = self
                .store
                .create_manual_merge(tenant_id, &candidate_ids, &review_reason)
                .await?;

            metrics::counter!(MANUAL_MERGES_QUEUED).increment(1);
            info!(tenant_id, %base_id, count, "merge queued for manual review");
            return Ok(MergeOutcome::ManualReview {
                entry,
                fallback: base_id,
            });
        }

        let plan = build_plan(tenant_id, &candidates, reason);
        let (profile, record) = self.store.apply_merge(plan).await?;

        metrics::counter!(PROFILES_MERGED).increment(record.merged_profile_ids.len() as u64);
        info!(
            tenant_id,
            base_id = %profile.id,
            merged = record.merged_profile_ids.len(),
            "merged profiles"
        );
        Ok(MergeOutcome::Merged { profile, record })
    }
}

/// The merged state of `candidates`, whose first element is the base.
fn build_plan(tenant_id: &str, candidates: &[CustomerProfile], reason: &str) -> MergePlan {
    let (base, losers) = candidates.split_at(1);
    let base = &base[0];

    let mut identifiers = base.identifiers.clone();
    let mut lifetime_value = base.lifetime_value;
    let mut total_orders = base.total_orders;
    for loser in losers {
        identifiers.absorb(&loser.identifiers);
        lifetime_value += loser.lifetime_value;
        total_orders += loser.total_orders;
    }

    MergePlan {
        tenant_id: tenant_id.to_owned(),
        base_id: base.id,
        loser_ids: losers.iter().map(|p| p.id).collect(),
        profile_strength: i16::from(profile_strength(&identifiers)),
        identifiers,
        lifetime_value,
        total_orders,
        reason: reason.to_owned(),
        before: candidates.iter().map(CustomerProfile::snapshot).collect(),
    }
}
