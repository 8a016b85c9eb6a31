//! Export queue service - coalescing enqueue and bucketed distribution

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use regsync_domain::{Distribution, ObjectType, QueueConfig, QueueEntry, Result};
use tracing::{debug, info, warn};

use super::ports::{ExportQueueRepository, HouseProviderResolver};
use crate::unix_now;

/// Decouples frequent change signals from the cost of running operations.
pub struct ExportQueue {
    repository: Arc<dyn ExportQueueRepository>,
    resolver: Arc<dyn HouseProviderResolver>,
    config: QueueConfig,
}

impl ExportQueue {
    pub fn new(
        repository: Arc<dyn ExportQueueRepository>,
        resolver: Arc<dyn HouseProviderResolver>,
        config: QueueConfig,
    ) -> Self {
        Self { repository, resolver, config }
    }

    /// Record that an object needs syncing.
    ///
    /// Coalesces per `(object_id, house_id)`: a second call only moves the
    /// timestamps. Without a house id the object is treated as its own house.
    pub async fn enqueue(
        &self,
        object_type: ObjectType,
        object_id: &str,
        house_id: Option<&str>,
        delay: Option<Duration>,
    ) -> Result<QueueEntry> {
        let now = unix_now();
        let delay = delay.unwrap_or(Duration::from_secs(self.config.default_delay_secs));
        let eligible_at = now.saturating_add(i64::try_from(delay.as_secs()).unwrap_or(i64::MAX));
        let house_id = house_id.filter(|h| !h.is_empty()).unwrap_or(object_id);

        let entry = QueueEntry::new(object_type, object_id, house_id, now, eligible_at);
        self.repository.upsert(&entry).await?;

        debug!(
            object_type = %entry.object_type,
            object_id,
            house_id,
            eligible_at,
            "Enqueued object for export"
        );
        Ok(entry)
    }

    /// Pull eligible entries for `types` (priority subset when empty) and
    /// group them `type -> provider -> house -> {id: enqueued_at}`.
    ///
    /// Each object id appears at most once per type. Entries whose house has
    /// no provider stay queued. Consumed entries are deleted, or retained
    /// when `retention_secs > 0`.
    pub async fn distribute(&self, types: &[ObjectType]) -> Result<Distribution> {
        let types: Vec<ObjectType> =
            if types.is_empty() { ObjectType::DISTRIBUTION_ORDER.to_vec() } else { types.to_vec() };
        let now = unix_now();

        let entries = self.repository.eligible(&types, now).await?;
        if entries.is_empty() {
            return Ok(Distribution::default());
        }

        let house_ids: Vec<String> = entries
            .iter()
            .map(|e| e.house_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let house_to_provider = self.resolve_houses(&house_ids).await?;

        let mut distribution = Distribution::default();
        let mut seen: HashSet<(ObjectType, String)> = HashSet::new();
        let mut consumed = Vec::new();
        let mut unresolved = 0usize;

        for entry in &entries {
            let Some(provider_id) = house_to_provider.get(&entry.house_id) else {
                unresolved += 1;
                continue;
            };

            // Coalesced duplicates are consumed with the first occurrence.
            if seen.insert((entry.object_type.clone(), entry.object_id.clone())) {
                distribution.insert(
                    entry.object_type.clone(),
                    provider_id,
                    &entry.house_id,
                    &entry.object_id,
                    entry.enqueued_at,
                );
            }
            consumed.push(entry.consume_key());
        }

        if unresolved > 0 {
            warn!(count = unresolved, "Queue entries left in place: house has no provider");
        }

        let removed = if self.config.retention_secs == 0 {
            self.repository.delete_consumed(&consumed).await?
        } else {
            self.repository.mark_consumed(&consumed, now).await?
        };

        info!(
            eligible = entries.len(),
            distributed = distribution.object_count(),
            consumed = removed,
            "Distributed export queue"
        );
        Ok(distribution)
    }

    /// Delete retained entries older than the retention window.
    pub async fn purge(&self) -> Result<usize> {
        if self.config.retention_secs == 0 {
            return Ok(0);
        }
        let retention = i64::try_from(self.config.retention_secs).unwrap_or(i64::MAX);
        let purged = self.repository.purge_consumed(unix_now().saturating_sub(retention)).await?;
        if purged > 0 {
            info!(purged, "Purged consumed queue entries");
        }
        Ok(purged)
    }

    pub async fn find(&self, object_id: &str, house_id: &str) -> Result<Option<QueueEntry>> {
        self.repository.find(object_id, house_id).await
    }

    /// `house_id -> provider_id`; a house with several providers goes to the
    /// first in sorted order.
    async fn resolve_houses(&self, house_ids: &[String]) -> Result<BTreeMap<String, String>> {
        let providers = self.resolver.resolve_providers_for_houses(house_ids).await?;
        let sorted: BTreeMap<_, _> = providers.into_iter().collect();

        let mut house_to_provider = BTreeMap::new();
        for (provider_id, houses) in sorted {
            for house_id in houses {
                house_to_provider.entry(house_id).or_insert_with(|| provider_id.clone());
            }
        }
        Ok(house_to_provider)
    }
}
