use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::identifiers::IdentifierSet;

/// The canonical record of one customer within a tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerProfile {
    pub id: Uuid,
    pub tenant_id: String,
    pub identifiers: IdentifierSet,
    pub profile_strength: i16,
    pub lifetime_value: f64,
    pub total_orders: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CustomerProfile {
    pub fn snapshot(&self) -> ProfileSnapshot {
        ProfileSnapshot {
            id: self.id,
            identifiers: self.identifiers.clone(),
            profile_strength: self.profile_strength,
            lifetime_value: self.lifetime_value,
            total_orders: self.total_orders,
            created_at: self.created_at,
        }
    }
}

// The chunk of data needed to create a profile
#[derive(Debug, Clone, PartialEq)]
pub struct NewProfile {
    pub tenant_id: String,
    pub identifiers: IdentifierSet,
}

impl NewProfile {
    pub fn new(tenant_id: &str, identifiers: IdentifierSet) -> Self {
        Self {
            tenant_id: tenant_id.to_owned(),
            identifiers,
        }
    }

    pub fn profile_strength(&self) -> i16 {
        i16::from(self.identifiers.strength())
    }
}

/// An ingested event as received, before and after resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub id: Uuid,
    pub tenant_id: String,
    pub event_type: String,
    pub payload: Value,
    pub profile_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewRawEvent {
    pub id: Uuid,
    pub tenant_id: String,
    pub event_type: String,
    pub payload: Value,
    pub profile_id: Option<Uuid>,
}

/// State of a profile as recorded in merge history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileSnapshot {
    pub id: Uuid,
    pub identifiers: IdentifierSet,
    pub profile_strength: i16,
    pub lifetime_value: f64,
    pub total_orders: i64,
    pub created_at: DateTime<Utc>,
}

/// Append-only audit entry for an automatic merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeRecord {
    pub id: Uuid,
    pub tenant_id: String,
    pub base_profile_id: Uuid,
    pub merged_profile_ids: Vec<Uuid>,
    pub reason: String,
    pub before: Vec<ProfileSnapshot>,
    pub after: ProfileSnapshot,
    pub created_at: DateTime<Utc>,
}

/// Everything the store needs to apply one merge atomically. The merged
/// profile fields are computed by the caller; the store only writes them.
#[derive(Debug, Clone, PartialEq)]
pub struct MergePlan {
    pub tenant_id: String,
    pub base_id: Uuid,
    pub loser_ids: Vec<Uuid>,
    pub identifiers: IdentifierSet,
    pub profile_strength: i16,
    pub lifetime_value: f64,
    pub total_orders: i64,
    pub reason: String,
    pub before: Vec<ProfileSnapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManualMergeStatus {
    Pending,
    Resolved,
}

impl ManualMergeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManualMergeStatus::Pending => "pending",
            ManualMergeStatus::Resolved => "resolved",
        }
    }
}

impl fmt::Display for ManualMergeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ManualMergeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ManualMergeStatus::Pending),
            "resolved" => Ok(ManualMergeStatus::Resolved),
            invalid => Err(format!("{invalid} is not a valid ManualMergeStatus")),
        }
    }
}

/// A merge that exceeded the automatic threshold and waits for a human.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualMergeEntry {
    pub id: Uuid,
    pub tenant_id: String,
    pub profile_ids: Vec<Uuid>,
    pub reason: String,
    pub status: ManualMergeStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Lifetime value and order count derived from a profile's purchase events.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ProfileStatistics {
    pub lifetime_value: f64,
    pub total_orders: i64,
}

const PURCHASE_EVENT_TYPES: [&str; 6] = [
    "purchase",
    "pos_transaction",
    "pos_sale",
    "pos_purchase",
    "order_created",
    "order_paid",
];

const AMOUNT_FIELDS: [&str; 5] = [
    "total_spent",
    "total",
    "amount",
    "order_total",
    "transaction_amount",
];

pub fn is_purchase_event(event_type: &str) -> bool {
    PURCHASE_EVENT_TYPES.contains(&event_type)
}

/// The monetary amount of a purchase payload: the first amount field that
/// holds a number or a numeric string.
pub fn purchase_amount(payload: &Value) -> Option<f64> {
    AMOUNT_FIELDS.iter().find_map(|field| match payload.get(*field)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    })
}

impl ProfileStatistics {
    /// Fold purchase events into totals. Purchases without a readable amount
    /// still count as orders.
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a RawEvent>) -> Self {
        events
            .into_iter()
            .filter(|event| is_purchase_event(&event.event_type))
            .fold(ProfileStatistics::default(), |mut stats, event| {
                stats.total_orders += 1;
                stats.lifetime_value += purchase_amount(&event.payload).unwrap_or(0.0);
                stats
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(event_type: &str, payload: Value) -> RawEvent {
        RawEvent {
            id: Uuid::now_v7(),
            tenant_id: "T1".to_string(),
            event_type: event_type.to_string(),
            payload,
            profile_id: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_purchase_amount_probes_fields_in_order() {
        assert_eq!(purchase_amount(&json!({ "total": "19.99" })), Some(19.99));
        assert_eq!(
            purchase_amount(&json!({ "amount": 5, "order_total": 7 })),
            Some(5.0)
        );
        assert_eq!(purchase_amount(&json!({ "total": "n/a" })), None);
        assert_eq!(purchase_amount(&json!({ "price": 3 })), None);
    }

    #[test]
    fn test_statistics_only_count_purchases() {
        let events = vec![
            event("purchase", json!({ "total": 10.5 })),
            event("pos_sale", json!({ "transaction_amount": "4.50" })),
            event("order_paid", json!({})),
            event("page_view", json!({ "total": 1000 })),
        ];

        let stats = ProfileStatistics::from_events(&events);

        assert_eq!(stats.total_orders, 3);
        assert!((stats.lifetime_value - 15.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_manual_merge_status_round_trips_through_str() {
        for status in [ManualMergeStatus::Pending, ManualMergeStatus::Resolved] {
            assert_eq!(status.as_str().parse::<ManualMergeStatus>(), Ok(status));
        }
        assert!("open".parse::<ManualMergeStatus>().is_err());
    }
}
