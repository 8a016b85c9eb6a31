//! Request-scoped cache owned by one operation run.

use std::collections::HashMap;

/// Provider reference data fetched during one run.
///
/// Cleared at INIT so a restarted operation never reuses stale lookups.
#[derive(Debug, Default)]
pub struct RequestCache {
    provider_contexts: HashMap<String, serde_json::Value>,
}

impl RequestCache {
    pub fn provider_context(&self, provider_id: &str) -> Option<&serde_json::Value> {
        self.provider_contexts.get(provider_id)
    }

    pub fn insert_provider_context(&mut self, provider_id: &str, context: serde_json::Value) {
        self.provider_contexts.insert(provider_id.to_string(), context);
    }

    pub fn clear(&mut self) {
        self.provider_contexts.clear();
    }

    pub fn len(&self) -> usize {
        self.provider_contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.provider_contexts.is_empty()
    }
}
