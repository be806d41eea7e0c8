use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::types::Json;
use tracing::debug;
use uuid::Uuid;

use super::{ProfileStore, StoreError};
use crate::identifiers::{IdentifierKind, IdentifierSet};
use crate::types::{
    CustomerProfile, ManualMergeEntry, ManualMergeStatus, MergePlan, MergeRecord, NewProfile,
    NewRawEvent, ProfileSnapshot, ProfileStatistics, RawEvent,
};

const PROFILE_COLUMNS: &str = "id, tenant_id, identifiers, profile_strength, lifetime_value, total_orders, created_at, updated_at";
const EVENT_COLUMNS: &str = "id, tenant_id, event_type, payload, profile_id, created_at";
const MERGE_COLUMNS: &str = "id, tenant_id, base_profile_id, merged_profile_ids, reason, before_snapshot, after_snapshot, created_at";
const MANUAL_MERGE_COLUMNS: &str =
    "id, tenant_id, profile_ids, reason, status, created_at, resolved_at";

const UNIQUE_VIOLATION: &str = "23505";
const FOREIGN_KEY_VIOLATION: &str = "23503";

#[derive(sqlx::FromRow)]
struct ProfileRow {
    id: Uuid,
    tenant_id: String,
    identifiers: Json<IdentifierSet>,
    profile_strength: i16,
    lifetime_value: f64,
    total_orders: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ProfileRow> for CustomerProfile {
    fn from(row: ProfileRow) -> Self {
        CustomerProfile {
            id: row.id,
            tenant_id: row.tenant_id,
            identifiers: row.identifiers.0,
            profile_strength: row.profile_strength,
            lifetime_value: row.lifetime_value,
            total_orders: row.total_orders,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: Uuid,
    tenant_id: String,
    event_type: String,
    payload: Json<serde_json::Value>,
    profile_id: Option<Uuid>,
    created_at: DateTime<Utc>,
}

impl From<EventRow> for RawEvent {
    fn from(row: EventRow) -> Self {
        RawEvent {
            id: row.id,
            tenant_id: row.tenant_id,
            event_type: row.event_type,
            payload: row.payload.0,
            profile_id: row.profile_id,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct MergeRow {
    id: Uuid,
    tenant_id: String,
    base_profile_id: Uuid,
    merged_profile_ids: Vec<Uuid>,
    reason: String,
    before_snapshot: Json<Vec<ProfileSnapshot>>,
    after_snapshot: Json<ProfileSnapshot>,
    created_at: DateTime<Utc>,
}

impl From<MergeRow> for MergeRecord {
    fn from(row: MergeRow) -> Self {
        MergeRecord {
            id: row.id,
            tenant_id: row.tenant_id,
            base_profile_id: row.base_profile_id,
            merged_profile_ids: row.merged_profile_ids,
            reason: row.reason,
            before: row.before_snapshot.0,
            after: row.after_snapshot.0,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ManualMergeRow {
    id: Uuid,
    tenant_id: String,
    profile_ids: Vec<Uuid>,
    reason: String,
    status: String,
    created_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
}

impl TryFrom<ManualMergeRow> for ManualMergeEntry {
    type Error = StoreError;

    fn try_from(row: ManualMergeRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<ManualMergeStatus>()
            .map_err(|e| StoreError::Database {
                command: "SELECT manual_merge_queue".to_owned(),
                error: sqlx::Error::Decode(e.into()),
            })?;

        Ok(ManualMergeEntry {
            id: row.id,
            tenant_id: row.tenant_id,
            profile_ids: row.profile_ids,
            reason: row.reason,
            status,
            created_at: row.created_at,
            resolved_at: row.resolved_at,
        })
    }
}

fn query_error(command: &str, error: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_error) = &error {
        if db_error.code().as_deref() == Some(UNIQUE_VIOLATION) {
            return StoreError::Conflict(db_error.message().to_owned());
        }
    }
    StoreError::Database {
        command: command.to_owned(),
        error,
    }
}

/// A `ProfileStore` backed by Postgres. Identifier sets are stored as JSONB
/// and matched with containment, served by a GIN index.
#[derive(Clone)]
pub struct PgProfileStore {
    pool: PgPool,
}

impl PgProfileStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn write_statistics(
        &self,
        tenant_id: &str,
        profile_id: Uuid,
        stats: ProfileStatistics,
    ) -> Result<CustomerProfile, StoreError> {
        let row: Option<ProfileRow> = sqlx::query_as(&format!(
            r#"
UPDATE customer_profiles
SET lifetime_value = $3, total_orders = $4, updated_at = NOW()
WHERE tenant_id = $1 AND id = $2
RETURNING {PROFILE_COLUMNS}
            "#
        ))
        .bind(tenant_id)
        .bind(profile_id)
        .bind(stats.lifetime_value)
        .bind(stats.total_orders)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| query_error("UPDATE customer_profiles statistics", e))?;

        row.map(CustomerProfile::from)
            .ok_or_else(|| StoreError::profile_not_found(profile_id))
    }
}

#[async_trait]
impl ProfileStore for PgProfileStore {
    async fn find_profile_ids(
        &self,
        tenant_id: &str,
        kind: IdentifierKind,
        value: &str,
    ) -> Result<Vec<Uuid>, StoreError> {
        sqlx::query_scalar(
            r#"
SELECT id FROM customer_profiles
WHERE tenant_id = $1 AND identifiers @> jsonb_build_object($2::text, $3::text)
ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(tenant_id)
        .bind(kind.as_str())
        .bind(value)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_error("SELECT customer_profiles by identifier", e))
    }

    async fn get_profile(&self, tenant_id: &str, id: Uuid) -> Result<CustomerProfile, StoreError> {
        let row: Option<ProfileRow> = sqlx::query_as(&format!(
            "SELECT {PROFILE_COLUMNS} FROM customer_profiles WHERE tenant_id = $1 AND id = $2"
        ))
        .bind(tenant_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| query_error("SELECT customer_profiles", e))?;

        row.map(CustomerProfile::from)
            .ok_or_else(|| StoreError::profile_not_found(id))
    }

    async fn get_profiles(
        &self,
        tenant_id: &str,
        ids: &[Uuid],
    ) -> Result<Vec<CustomerProfile>, StoreError> {
        let rows: Vec<ProfileRow> = sqlx::query_as(&format!(
            "SELECT {PROFILE_COLUMNS} FROM customer_profiles WHERE tenant_id = $1 AND id = ANY($2)"
        ))
        .bind(tenant_id)
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_error("SELECT customer_profiles", e))?;

        Ok(rows.into_iter().map(CustomerProfile::from).collect())
    }

    async fn create_profile(&self, profile: NewProfile) -> Result<CustomerProfile, StoreError> {
        let row: ProfileRow = sqlx::query_as(&format!(
            r#"
INSERT INTO customer_profiles (id, tenant_id, identifiers, profile_strength)
VALUES ($1, $2, $3, $4)
RETURNING {PROFILE_COLUMNS}
            "#
        ))
        .bind(Uuid::now_v7())
        .bind(&profile.tenant_id)
        .bind(Json(&profile.identifiers))
        .bind(profile.profile_strength())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| query_error("INSERT customer_profiles", e))?;

        Ok(row.into())
    }

    async fn add_identifiers(
        &self,
        tenant_id: &str,
        id: Uuid,
        identifiers: &IdentifierSet,
    ) -> Result<CustomerProfile, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| query_error("BEGIN", e))?;

        let current: Option<Json<IdentifierSet>> = sqlx::query_scalar(
            "SELECT identifiers FROM customer_profiles WHERE tenant_id = $1 AND id = $2 FOR UPDATE",
        )
        .bind(tenant_id)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| query_error("SELECT customer_profiles FOR UPDATE", e))?;

        let Some(Json(mut merged)) = current else {
            return Err(StoreError::profile_not_found(id));
        };
        merged.absorb(identifiers);

        let row: ProfileRow = sqlx::query_as(&format!(
            r#"
UPDATE customer_profiles
SET identifiers = $3, profile_strength = $4, updated_at = NOW()
WHERE tenant_id = $1 AND id = $2
RETURNING {PROFILE_COLUMNS}
            "#
        ))
        .bind(tenant_id)
        .bind(id)
        .bind(Json(&merged))
        .bind(i16::from(merged.strength()))
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| query_error("UPDATE customer_profiles identifiers", e))?;

        tx.commit().await.map_err(|e| query_error("COMMIT", e))?;

        Ok(row.into())
    }

    async fn insert_raw_event(&self, event: NewRawEvent) -> Result<RawEvent, StoreError> {
        let inserted: Option<EventRow> = sqlx::query_as(&format!(
            r#"
INSERT INTO customer_raw_events (id, tenant_id, event_type, payload, profile_id)
VALUES ($1, $2, $3, $4, $5)
ON CONFLICT (id) DO NOTHING
RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(event.id)
        .bind(&event.tenant_id)
        .bind(&event.event_type)
        .bind(Json(&event.payload))
        .bind(event.profile_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| query_error("INSERT customer_raw_events", e))?;

        if let Some(row) = inserted {
            return Ok(row.into());
        }

        debug!(event_id = %event.id, "raw event already stored");
        let existing: Option<EventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM customer_raw_events WHERE tenant_id = $1 AND id = $2"
        ))
        .bind(&event.tenant_id)
        .bind(event.id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| query_error("SELECT customer_raw_events", e))?;

        // The id exists, but under another tenant
        existing.map(RawEvent::from).ok_or_else(|| {
            StoreError::Conflict(format!("raw event {} belongs to another tenant", event.id))
        })
    }

    async fn attach_event(
        &self,
        tenant_id: &str,
        event_id: Uuid,
        profile_id: Uuid,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
UPDATE customer_raw_events SET profile_id = $3
WHERE tenant_id = $1 AND id = $2 AND profile_id IS NULL
            "#,
        )
        .bind(tenant_id)
        .bind(event_id)
        .bind(profile_id)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db_error)
                if db_error.code().as_deref() == Some(FOREIGN_KEY_VIOLATION) =>
            {
                StoreError::profile_not_found(profile_id)
            }
            _ => query_error("UPDATE customer_raw_events profile", e),
        })?;

        Ok(result.rows_affected() == 1)
    }

    async fn apply_merge(
        &self,
        plan: MergePlan,
    ) -> Result<(CustomerProfile, MergeRecord), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| query_error("BEGIN", e))?;

        // Row locks make a concurrent attach to a loser either commit before
        // the events are re-pointed or wait and fail on the deleted row.
        let mut involved = plan.loser_ids.clone();
        involved.push(plan.base_id);
        let locked: Vec<Uuid> = sqlx::query_scalar(
            r#"
SELECT id FROM customer_profiles
WHERE tenant_id = $1 AND id = ANY($2)
ORDER BY id
FOR UPDATE
            "#,
        )
        .bind(&plan.tenant_id)
        .bind(&involved[..])
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| query_error("SELECT customer_profiles merge FOR UPDATE", e))?;

        if let Some(missing) = involved.iter().find(|id| !locked.contains(*id)) {
            return Err(StoreError::profile_not_found(*missing));
        }

        let base: Option<ProfileRow> = sqlx::query_as(&format!(
            r#"
UPDATE customer_profiles
SET identifiers = $3, profile_strength = $4, lifetime_value = $5, total_orders = $6, updated_at = NOW()
WHERE tenant_id = $1 AND id = $2
RETURNING {PROFILE_COLUMNS}
            "#
        ))
        .bind(&plan.tenant_id)
        .bind(plan.base_id)
        .bind(Json(&plan.identifiers))
        .bind(plan.profile_strength)
        .bind(plan.lifetime_value)
        .bind(plan.total_orders)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| query_error("UPDATE customer_profiles merge", e))?;

        let Some(base) = base.map(CustomerProfile::from) else {
            return Err(StoreError::profile_not_found(plan.base_id));
        };

        // Must happen before the losers are deleted, the foreign key would
        // otherwise null these references.
        sqlx::query(
            r#"
UPDATE customer_raw_events SET profile_id = $3
WHERE tenant_id = $1 AND profile_id = ANY($2)
            "#,
        )
        .bind(&plan.tenant_id)
        .bind(&plan.loser_ids[..])
        .bind(plan.base_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| query_error("UPDATE customer_raw_events merge", e))?;

        let deleted: Vec<Uuid> = sqlx::query_scalar(
            "DELETE FROM customer_profiles WHERE tenant_id = $1 AND id = ANY($2) RETURNING id",
        )
        .bind(&plan.tenant_id)
        .bind(&plan.loser_ids[..])
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| query_error("DELETE customer_profiles", e))?;

        if let Some(missing) = plan.loser_ids.iter().find(|id| !deleted.contains(*id)) {
            // Dropping the transaction rolls it back
            return Err(StoreError::profile_not_found(*missing));
        }

        let record: MergeRow = sqlx::query_as(&format!(
            r#"
INSERT INTO merge_history (id, tenant_id, base_profile_id, merged_profile_ids, reason, before_snapshot, after_snapshot)
VALUES ($1, $2, $3, $4, $5, $6, $7)
RETURNING {MERGE_COLUMNS}
            "#
        ))
        .bind(Uuid::now_v7())
        .bind(&plan.tenant_id)
        .bind(plan.base_id)
        .bind(&plan.loser_ids[..])
        .bind(&plan.reason)
        .bind(Json(&plan.before))
        .bind(Json(base.snapshot()))
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| query_error("INSERT merge_history", e))?;

        tx.commit().await.map_err(|e| query_error("COMMIT", e))?;

        Ok((base, record.into()))
    }

    async fn create_manual_merge(
        &self,
        tenant_id: &str,
        profile_ids: &[Uuid],
        reason: &str,
    ) -> Result<ManualMergeEntry, StoreError> {
        let row: ManualMergeRow = sqlx::query_as(&format!(
            r#"
INSERT INTO manual_merge_queue (id, tenant_id, profile_ids, reason, status)
VALUES ($1, $2, $3, $4, 'pending')
RETURNING {MANUAL_MERGE_COLUMNS}
            "#
        ))
        .bind(Uuid::now_v7())
        .bind(tenant_id)
        .bind(profile_ids)
        .bind(reason)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| query_error("INSERT manual_merge_queue", e))?;

        row.try_into()
    }

    async fn list_manual_merges(
        &self,
        tenant_id: &str,
        status: Option<ManualMergeStatus>,
    ) -> Result<Vec<ManualMergeEntry>, StoreError> {
        let rows: Vec<ManualMergeRow> = sqlx::query_as(&format!(
            r#"
SELECT {MANUAL_MERGE_COLUMNS} FROM manual_merge_queue
WHERE tenant_id = $1 AND ($2::text IS NULL OR status = $2)
ORDER BY created_at ASC
            "#
        ))
        .bind(tenant_id)
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_error("SELECT manual_merge_queue", e))?;

        rows.into_iter().map(ManualMergeEntry::try_from).collect()
    }

    async fn resolve_manual_merge(
        &self,
        tenant_id: &str,
        id: Uuid,
    ) -> Result<ManualMergeEntry, StoreError> {
        let row: Option<ManualMergeRow> = sqlx::query_as(&format!(
            r#"
UPDATE manual_merge_queue
SET status = 'resolved', resolved_at = COALESCE(resolved_at, NOW())
WHERE tenant_id = $1 AND id = $2
RETURNING {MANUAL_MERGE_COLUMNS}
            "#
        ))
        .bind(tenant_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| query_error("UPDATE manual_merge_queue", e))?;

        match row {
            Some(row) => row.try_into(),
            None => Err(StoreError::NotFound {
                entity: "manual merge",
                id,
            }),
        }
    }

    async fn merge_history(
        &self,
        tenant_id: &str,
        profile_id: Uuid,
    ) -> Result<Vec<MergeRecord>, StoreError> {
        let rows: Vec<MergeRow> = sqlx::query_as(&format!(
            r#"
SELECT {MERGE_COLUMNS} FROM merge_history
WHERE tenant_id = $1 AND (base_profile_id = $2 OR $2 = ANY(merged_profile_ids))
ORDER BY created_at DESC
            "#
        ))
        .bind(tenant_id)
        .bind(profile_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_error("SELECT merge_history", e))?;

        Ok(rows.into_iter().map(MergeRecord::from).collect())
    }

    async fn events_for_profile(
        &self,
        tenant_id: &str,
        profile_id: Uuid,
    ) -> Result<Vec<RawEvent>, StoreError> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            r#"
SELECT {EVENT_COLUMNS} FROM customer_raw_events
WHERE tenant_id = $1 AND profile_id = $2
ORDER BY created_at ASC
            "#
        ))
        .bind(tenant_id)
        .bind(profile_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_error("SELECT customer_raw_events", e))?;

        Ok(rows.into_iter().map(RawEvent::from).collect())
    }

    async fn recompute_statistics(
        &self,
        tenant_id: &str,
        profile_id: Uuid,
    ) -> Result<CustomerProfile, StoreError> {
        let events = self.events_for_profile(tenant_id, profile_id).await?;
        let stats = ProfileStatistics::from_events(&events);
        self.write_statistics(tenant_id, profile_id, stats).await
    }
}
