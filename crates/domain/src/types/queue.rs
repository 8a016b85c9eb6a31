//! Export queue entries and distribution buckets.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::correlation::ObjectType;

/// Pending "object changed, must sync" signal.
///
/// Unique per `(object_id, house_id)`; re-enqueueing refreshes the
/// timestamps. `consumed_at` is only set when consumed entries are retained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub object_type: ObjectType,
    pub object_id: String,
    pub house_id: String,
    pub enqueued_at: i64,
    pub eligible_at: i64,
    pub consumed_at: Option<i64>,
}

impl QueueEntry {
    pub fn new(
        object_type: ObjectType,
        object_id: impl Into<String>,
        house_id: impl Into<String>,
        enqueued_at: i64,
        eligible_at: i64,
    ) -> Self {
        Self {
            object_type,
            object_id: object_id.into(),
            house_id: house_id.into(),
            enqueued_at,
            eligible_at,
            consumed_at: None,
        }
    }

    /// Key plus the enqueue time it was read with, so consuming an entry
    /// that was refreshed in the meantime is a no-op.
    pub fn consume_key(&self) -> QueueConsumeKey {
        QueueConsumeKey {
            object_id: self.object_id.clone(),
            house_id: self.house_id.clone(),
            enqueued_at: self.enqueued_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueConsumeKey {
    pub object_id: String,
    pub house_id: String,
    pub enqueued_at: i64,
}

/// `house_id -> { object_id: enqueued_at }`
pub type HouseBuckets = BTreeMap<String, BTreeMap<String, i64>>;

/// Result of one distribution pass:
/// `object type -> provider -> house -> { object id: enqueued_at }`.
///
/// Types iterate in priority order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Distribution {
    pub buckets: BTreeMap<ObjectType, BTreeMap<String, HouseBuckets>>,
}

impl Distribution {
    pub fn insert(
        &mut self,
        object_type: ObjectType,
        provider_id: &str,
        house_id: &str,
        object_id: &str,
        enqueued_at: i64,
    ) {
        self.buckets
            .entry(object_type)
            .or_default()
            .entry(provider_id.to_string())
            .or_default()
            .entry(house_id.to_string())
            .or_default()
            .insert(object_id.to_string(), enqueued_at);
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn object_count(&self) -> usize {
        self.buckets
            .values()
            .flat_map(|providers| providers.values())
            .flat_map(|houses| houses.values())
            .map(BTreeMap::len)
            .sum()
    }

    pub fn types(&self) -> impl Iterator<Item = &ObjectType> {
        self.buckets.keys()
    }

    /// `object id -> house id` per `(type, provider)` bucket, in type
    /// priority order.
    pub fn provider_batches(&self) -> Vec<(ObjectType, String, BTreeMap<String, String>)> {
        let mut batches = Vec::new();
        for (object_type, providers) in &self.buckets {
            for (provider_id, houses) in providers {
                let objects = houses
                    .iter()
                    .flat_map(|(house_id, objects)| {
                        objects.keys().map(move |object_id| (object_id.clone(), house_id.clone()))
                    })
                    .collect();
                batches.push((object_type.clone(), provider_id.clone(), objects));
            }
        }
        batches
    }
}
