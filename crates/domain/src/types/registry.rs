//! Registry request/response shapes exchanged with the transport.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::correlation::ObjectType;

/// Request body for one submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryPayload {
    pub operation: String,
    pub object_type: ObjectType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    /// Provider-level reference data shared by every item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    pub items: Vec<PayloadItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadItem {
    pub transport_id: String,
    pub object_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub body: serde_json::Value,
}

/// Acknowledgment returned by a submission; used to poll and fetch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AckToken(pub String);

impl AckToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AckToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Processing state reported by the registry for an acknowledged request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollState {
    Received,
    Processing,
    Successful,
}

impl PollState {
    pub fn is_complete(self) -> bool {
        matches!(self, Self::Successful)
    }
}

/// Registry-side error attached to a result or an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub code: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ItemError {
    pub fn new(code: impl Into<String>, description: impl Into<String>) -> Self {
        Self { code: code.into(), description: description.into(), detail: None }
    }

    pub fn message(&self) -> String {
        match &self.detail {
            Some(detail) => format!("[{}] {} ({})", self.code, self.description, detail),
            None => format!("[{}] {}", self.code, self.description),
        }
    }
}

/// Identity assigned by the registry to an accepted item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemSuccess {
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
    /// Extra fields import variants persist alongside the identity.
    #[serde(default)]
    pub attributes: serde_json::Value,
}

/// Outcome for one submitted item. Nested imports carry their per-group
/// results in `children`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultItem {
    #[serde(default)]
    pub transport_id: Option<String>,
    #[serde(default)]
    pub errors: Vec<ItemError>,
    #[serde(default)]
    pub success: Option<ItemSuccess>,
    #[serde(default)]
    pub children: Vec<ResultItem>,
}

impl ResultItem {
    pub fn success(transport_id: impl Into<String>, success: ItemSuccess) -> Self {
        Self {
            transport_id: Some(transport_id.into()),
            errors: Vec::new(),
            success: Some(success),
            children: Vec::new(),
        }
    }

    pub fn failure(transport_id: impl Into<String>, errors: Vec<ItemError>) -> Self {
        Self {
            transport_id: Some(transport_id.into()),
            errors,
            success: None,
            children: Vec::new(),
        }
    }
}

/// Structured registry response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryResult {
    /// Set when the whole request was rejected.
    #[serde(default)]
    pub error: Option<ItemError>,
    #[serde(default)]
    pub items: Vec<ResultItem>,
}

/// What fetching a finished request yields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum FetchOutcome {
    Response(RegistryResult),
    Fault(ItemError),
}
