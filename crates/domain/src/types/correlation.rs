//! Correlation between local objects and their registry identities.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::impl_domain_status_conversions;

/// Kind of synchronizable business object.
///
/// Ordering follows the registry's dependency order (a house must exist
/// before its premises, premises before accounts, ...). Types the registry
/// integration does not know about sort last, by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ObjectType {
    House,
    Entrance,
    Premises,
    Room,
    Account,
    Meter,
    Contract,
    ReferenceItem,
    Other(String),
}

impl ObjectType {
    /// Types distributed by default, in priority order.
    pub const DISTRIBUTION_ORDER: [ObjectType; 7] = [
        ObjectType::House,
        ObjectType::Entrance,
        ObjectType::Premises,
        ObjectType::Room,
        ObjectType::Account,
        ObjectType::Meter,
        ObjectType::Contract,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            Self::House => "house",
            Self::Entrance => "entrance",
            Self::Premises => "premises",
            Self::Room => "room",
            Self::Account => "account",
            Self::Meter => "meter",
            Self::Contract => "contract",
            Self::ReferenceItem => "reference_item",
            Self::Other(name) => name,
        }
    }

    /// Position in the priority list; unknown types share the last slot.
    pub fn priority(&self) -> usize {
        match self {
            Self::House => 0,
            Self::Entrance => 1,
            Self::Premises => 2,
            Self::Room => 3,
            Self::Account => 4,
            Self::Meter => 5,
            Self::Contract => 6,
            Self::ReferenceItem => 7,
            Self::Other(_) => usize::MAX,
        }
    }

    /// The object is itself a house, so it is its own owning house.
    pub fn is_house_level(&self) -> bool {
        matches!(self, Self::House)
    }

    /// Each provider keeps its own record of these objects.
    pub fn is_provider_scoped(&self) -> bool {
        matches!(self, Self::Account | Self::Contract)
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for ObjectType {
    fn from(value: String) -> Self {
        match value.to_lowercase().as_str() {
            "house" => Self::House,
            "entrance" => Self::Entrance,
            "premises" => Self::Premises,
            "room" => Self::Room,
            "account" => Self::Account,
            "meter" => Self::Meter,
            "contract" => Self::Contract,
            "reference_item" => Self::ReferenceItem,
            _ => Self::Other(value),
        }
    }
}

impl From<&str> for ObjectType {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<ObjectType> for String {
    fn from(value: ObjectType) -> Self {
        match value {
            ObjectType::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl PartialOrd for ObjectType {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ObjectType {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority().cmp(&other.priority()).then_with(|| self.as_str().cmp(other.as_str()))
    }
}

/// Sync status of a correlation record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationStatus {
    New,
    Changed,
    Saved,
    Wip,
    NoResult,
    Error,
    Unknown,
}

impl_domain_status_conversions!(CorrelationStatus {
    New => "new",
    Changed => "changed",
    Saved => "saved",
    Wip => "wip",
    NoResult => "no_result",
    Error => "error",
    Unknown => "unknown",
});

/// Identity of a correlation record.
///
/// `provider_id` is only set for types owned per provider (accounts,
/// contracts); for the rest the record is shared.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationKey {
    pub object_type: ObjectType,
    pub object_id: String,
    pub provider_id: Option<String>,
}

impl CorrelationKey {
    pub fn new(object_type: ObjectType, object_id: impl Into<String>) -> Self {
        Self { object_type, object_id: object_id.into(), provider_id: None }
    }

    pub fn with_provider(mut self, provider_id: impl Into<String>) -> Self {
        self.provider_id = Some(provider_id.into());
        self
    }

    /// Key of `object_id` as seen by an operation for `provider_id`. The
    /// provider only becomes part of the identity for provider-scoped types.
    pub fn scoped(object_type: ObjectType, object_id: &str, provider_id: Option<&str>) -> Self {
        let provider_id =
            provider_id.filter(|_| object_type.is_provider_scoped()).map(str::to_string);
        Self { object_type, object_id: object_id.to_string(), provider_id }
    }

    /// Key used for object-scoped locks.
    pub fn lock_key(&self) -> String {
        format!("{}:{}", self.object_type, self.object_id)
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.provider_id {
            Some(provider) => write!(f, "{}:{}@{}", self.object_type, self.object_id, provider),
            None => write!(f, "{}:{}", self.object_type, self.object_id),
        }
    }
}

/// Link between one local object and its registry identity.
///
/// The mutators are pure state transitions; persisting them is the caller's
/// job. Timestamps are unix seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationRecord {
    pub object_type: ObjectType,
    pub object_id: String,
    pub provider_id: Option<String>,
    pub house_id: Option<String>,
    pub external_id: Option<String>,
    pub code: Option<String>,
    pub status: CorrelationStatus,
    pub deleted: bool,
    pub transport_id: Option<String>,
    pub batch_id: Option<String>,
    pub submitted_at: Option<i64>,
    pub last_error: Option<String>,
    pub saved_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl CorrelationRecord {
    pub fn new(key: CorrelationKey, house_id: Option<String>, now: i64) -> Self {
        Self {
            object_type: key.object_type,
            object_id: key.object_id,
            provider_id: key.provider_id,
            house_id,
            external_id: None,
            code: None,
            status: CorrelationStatus::New,
            deleted: false,
            transport_id: None,
            batch_id: None,
            submitted_at: None,
            last_error: None,
            saved_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> CorrelationKey {
        CorrelationKey {
            object_type: self.object_type.clone(),
            object_id: self.object_id.clone(),
            provider_id: self.provider_id.clone(),
        }
    }

    pub fn has_external_identity(&self) -> bool {
        self.external_id.is_some()
    }

    /// Submitted within `window_secs` and still awaiting a result.
    pub fn is_in_flight(&self, now: i64, window_secs: u64) -> bool {
        let window = i64::try_from(window_secs).unwrap_or(i64::MAX);
        self.status == CorrelationStatus::Wip
            && self.transport_id.is_some()
            && self.submitted_at.is_some_and(|at| now.saturating_sub(at) < window)
    }

    /// Assign a fresh transport id; any previous one is superseded.
    pub fn submit(&mut self, batch_id: &str, transport_id: &str, now: i64) {
        self.transport_id = Some(transport_id.to_string());
        self.batch_id = Some(batch_id.to_string());
        self.submitted_at = Some(now);
        self.status = CorrelationStatus::Wip;
        self.updated_at = now;
    }

    /// Record the registry identity. A success without an identifier leaves
    /// the record in `no_result`.
    pub fn save(
        &mut self,
        external_id: Option<String>,
        code: Option<String>,
        saved_at: i64,
        now: i64,
    ) {
        self.status = if external_id.is_some() || self.external_id.is_some() {
            CorrelationStatus::Saved
        } else {
            CorrelationStatus::NoResult
        };
        if external_id.is_some() {
            self.external_id = external_id;
        }
        if code.is_some() {
            self.code = code;
        }
        self.transport_id = None;
        self.last_error = None;
        self.saved_at = Some(saved_at);
        self.updated_at = now;
    }

    /// Mark failed; the external identity is kept.
    pub fn fail(&mut self, message: &str, now: i64) {
        self.status = CorrelationStatus::Error;
        self.last_error = Some(message.to_string());
        self.updated_at = now;
    }

    pub fn unmap(&mut self, now: i64) {
        self.transport_id = None;
        self.updated_at = now;
    }

    /// Sever the link to the registry object.
    pub fn reset(&mut self, now: i64) {
        self.external_id = None;
        self.code = None;
        self.status = CorrelationStatus::New;
        self.updated_at = now;
    }

    /// Outcome of a submission will never be known (operation canceled).
    pub fn abandon(&mut self, now: i64) {
        self.status = CorrelationStatus::Unknown;
        self.transport_id = None;
        self.updated_at = now;
    }

    /// A saved object was modified locally and needs a re-export.
    pub fn touch(&mut self, now: i64) {
        if self.status == CorrelationStatus::Saved {
            self.status = CorrelationStatus::Changed;
            self.updated_at = now;
        }
    }
}
