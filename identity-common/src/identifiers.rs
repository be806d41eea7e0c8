//! # Identifiers
//!
//! The closed set of identity signals a customer can be matched on, and the
//! normalizer that extracts them from heterogeneous source payloads.
use std::collections::btree_map;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

static EMAIL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email pattern is valid"));

const MIN_PHONE_DIGITS: usize = 10;
const MAX_PROFILE_STRENGTH: u8 = 100;

/// A kind of identity signal. Declaration order is match priority: it breaks
/// ties when listing matches and determines iteration order of an
/// `IdentifierSet`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierKind {
    Phone,
    Email,
    LoyaltyId,
    QrId,
    Whatsapp,
    Upi,
    CardLast4,
    DeviceId,
    CookieId,
}

impl IdentifierKind {
    pub const ALL: [IdentifierKind; 9] = [
        IdentifierKind::Phone,
        IdentifierKind::Email,
        IdentifierKind::LoyaltyId,
        IdentifierKind::QrId,
        IdentifierKind::Whatsapp,
        IdentifierKind::Upi,
        IdentifierKind::CardLast4,
        IdentifierKind::DeviceId,
        IdentifierKind::CookieId,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IdentifierKind::Phone => "phone",
            IdentifierKind::Email => "email",
            IdentifierKind::LoyaltyId => "loyalty_id",
            IdentifierKind::QrId => "qr_id",
            IdentifierKind::Whatsapp => "whatsapp",
            IdentifierKind::Upi => "upi",
            IdentifierKind::CardLast4 => "card_last4",
            IdentifierKind::DeviceId => "device_id",
            IdentifierKind::CookieId => "cookie_id",
        }
    }

    /// Contribution of this kind to a profile's strength score.
    pub fn weight(&self) -> u8 {
        match self {
            IdentifierKind::Phone | IdentifierKind::Email => 20,
            IdentifierKind::LoyaltyId | IdentifierKind::QrId => 15,
            IdentifierKind::Whatsapp | IdentifierKind::Upi => 10,
            IdentifierKind::CardLast4 => 5,
            IdentifierKind::DeviceId => 3,
            IdentifierKind::CookieId => 2,
        }
    }

    /// Normalize a raw value for this kind, or `None` if it is not usable.
    pub fn normalize_value(&self, raw: &str) -> Option<String> {
        match self {
            IdentifierKind::Phone | IdentifierKind::Whatsapp => {
                let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
                (digits.len() >= MIN_PHONE_DIGITS).then_some(digits)
            }
            IdentifierKind::Email => {
                let email = raw.trim().to_lowercase();
                EMAIL_PATTERN.is_match(&email).then_some(email)
            }
            IdentifierKind::CardLast4 => {
                let compact: Vec<char> = raw
                    .chars()
                    .filter(|c| !c.is_whitespace() && *c != '-')
                    .collect();
                let start = compact.len().saturating_sub(4);
                let last4: String = compact[start..].iter().collect();
                (!last4.is_empty()).then_some(last4)
            }
            _ => {
                let value = raw.trim();
                (!value.is_empty()).then(|| value.to_string())
            }
        }
    }
}

impl fmt::Display for IdentifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdentifierKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IdentifierKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("{s} is not a valid IdentifierKind"))
    }
}

/// Normalized identifiers of one customer, at most one value per kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentifierSet(BTreeMap<IdentifierKind, String>);

impl IdentifierSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: IdentifierKind) -> Option<&str> {
        self.0.get(&kind).map(String::as_str)
    }

    pub fn contains(&self, kind: IdentifierKind) -> bool {
        self.0.contains_key(&kind)
    }

    /// Set `kind` to an already-normalized value, replacing any previous one.
    pub fn insert(&mut self, kind: IdentifierKind, value: impl Into<String>) {
        self.0.insert(kind, value.into());
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Identifiers in priority order.
    pub fn iter(&self) -> impl Iterator<Item = (IdentifierKind, &str)> {
        self.0.iter().map(|(kind, value)| (*kind, value.as_str()))
    }

    /// Copy in every kind of `other` that is missing here. Existing values are
    /// never overwritten. Returns the number of kinds added.
    pub fn absorb(&mut self, other: &IdentifierSet) -> usize {
        let mut added = 0;
        for (kind, value) in &other.0 {
            if let btree_map::Entry::Vacant(entry) = self.0.entry(*kind) {
                entry.insert(value.clone());
                added += 1;
            }
        }
        added
    }

    /// The kinds of `other` that this set does not have yet.
    pub fn missing_from(&self, other: &IdentifierSet) -> IdentifierSet {
        IdentifierSet(
            other
                .0
                .iter()
                .filter(|(kind, _)| !self.0.contains_key(kind))
                .map(|(kind, value)| (*kind, value.clone()))
                .collect(),
        )
    }

    /// Weighted sum over the kinds present, capped at 100.
    pub fn strength(&self) -> u8 {
        let total: u32 = self.0.keys().map(|kind| u32::from(kind.weight())).sum();
        total.min(u32::from(MAX_PROFILE_STRENGTH)) as u8
    }
}

impl FromIterator<(IdentifierKind, String)> for IdentifierSet {
    fn from_iter<T: IntoIterator<Item = (IdentifierKind, String)>>(iter: T) -> Self {
        IdentifierSet(iter.into_iter().collect())
    }
}

// Nested objects and provider-specific field names, probed after the
// top-level kind names. The first candidate that normalizes wins.
const NESTED_PROBES: &[(&str, &str, IdentifierKind)] = &[
    ("customer", "phone", IdentifierKind::Phone),
    ("customer", "email", IdentifierKind::Email),
    ("customer", "loyalty_id", IdentifierKind::LoyaltyId),
    ("billing", "phone", IdentifierKind::Phone),
    ("billing", "email", IdentifierKind::Email),
];

const ALIASES: &[(&str, IdentifierKind)] = &[
    ("contact_email", IdentifierKind::Email),
    ("customer_email", IdentifierKind::Email),
    ("phone_number", IdentifierKind::Phone),
    ("customer_phone", IdentifierKind::Phone),
    ("card_number", IdentifierKind::CardLast4),
    ("card", IdentifierKind::CardLast4),
];

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn offer(set: &mut IdentifierSet, kind: IdentifierKind, candidate: Option<&Value>) {
    if set.contains(kind) {
        return;
    }
    if let Some(value) = candidate
        .and_then(scalar)
        .and_then(|raw| kind.normalize_value(&raw))
    {
        set.insert(kind, value);
    }
}

/// Extract and normalize every recognizable identifier from an event payload.
///
/// Never fails: values that are missing, of the wrong JSON type or invalid
/// after normalization are skipped. A non-object payload yields an empty set.
pub fn normalize(payload: &Value) -> IdentifierSet {
    let mut set = IdentifierSet::new();
    let Some(fields) = payload.as_object() else {
        return set;
    };

    for kind in IdentifierKind::ALL {
        offer(&mut set, kind, fields.get(kind.as_str()));
    }

    for (parent, field, kind) in NESTED_PROBES {
        let nested = fields.get(*parent).and_then(Value::as_object);
        offer(&mut set, *kind, nested.and_then(|obj| obj.get(*field)));
    }

    for (field, kind) in ALIASES {
        offer(&mut set, *kind, fields.get(*field));
    }

    set
}

/// A payload split into the fields identity resolution understands and
/// everything else, which is carried through untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentifiedPayload {
    pub identifiers: IdentifierSet,
    pub passthrough: Value,
}

impl IdentifiedPayload {
    pub fn from_value(payload: Value) -> Self {
        Self {
            identifiers: normalize(&payload),
            passthrough: payload,
        }
    }
}
