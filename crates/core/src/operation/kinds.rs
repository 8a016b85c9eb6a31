//! Operation variants and their stage hooks
//!
//! The set of operation kinds is closed; hooks branch on [`OperationKind`]
//! where a variant customizes a stage and share the default otherwise.

use std::collections::{HashMap, HashSet};

use regsync_domain::{
    CorrelationRecord, ExternalBusinessError, ItemError, ItemSuccess, OperationDirection,
    OperationStatus, RegistryError, RegistryResult, ResultItem,
};
use tracing::{debug, warn};

use super::engine::Operation;
use crate::unix_now;

/// Implementation behind an operation name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Push local objects to the registry.
    GenericExport,
    /// Pull registry identities and attributes for local objects.
    GenericImport,
    /// Import whose result groups child items under a parent entry.
    NestedImport,
}

impl OperationKind {
    pub fn is_import(self) -> bool {
        matches!(self, Self::GenericImport | Self::NestedImport)
    }

    pub fn direction(self) -> OperationDirection {
        if self.is_import() {
            OperationDirection::Import
        } else {
            OperationDirection::Export
        }
    }
}

/// A result item matched to its correlation record.
#[derive(Debug, Clone)]
pub struct SuccessItem {
    pub record: CorrelationRecord,
    pub success: ItemSuccess,
    /// Transport id of the enclosing group for nested results.
    pub group_id: Option<String>,
}

/// Result entry after flattening, tagged with its group.
struct FlatItem {
    item: ResultItem,
    group_id: Option<String>,
}

impl Operation {
    /// Drop objects that need no submission before records are created.
    ///
    /// Imports and updating exports keep everything; a plain export skips
    /// objects the registry already knows.
    pub async fn filter(&mut self, ids: Vec<String>) -> Result<Vec<String>, RegistryError> {
        if self.kind.is_import() || self.record.is_updating() {
            return Ok(ids);
        }

        let now = unix_now();
        let window = self.deps.config.live_transport_window_secs;
        let batch_id = self.record.batch_id().to_string();

        let mut kept = Vec::with_capacity(ids.len());
        for id in ids {
            let key = self.key_for(&id);
            match self.deps.correlations.find(&key).await? {
                Some(existing)
                    if existing.is_in_flight(now, window)
                        && existing.batch_id.as_deref() != Some(batch_id.as_str()) =>
                {
                    // Another submission owns the record until its result lands.
                    kept.push(id);
                }
                Some(mut existing) if !existing.deleted && existing.has_external_identity() => {
                    if existing.transport_id.is_some() {
                        self.deps.correlations.unmap(&mut existing).await?;
                    }
                    debug!(key = %key, "Already registered, not exporting");
                }
                _ => kept.push(id),
            }
        }
        Ok(kept)
    }

    /// Whether a loaded record is left out of the request. A skipped record
    /// is unmapped so a stale result cannot land on it.
    pub async fn is_skippable(
        &mut self,
        record: Option<&mut CorrelationRecord>,
    ) -> Result<bool, RegistryError> {
        if self.kind.is_import() {
            return Ok(false);
        }
        let Some(record) = record else {
            return Ok(false);
        };

        let skip =
            !record.deleted && !self.record.is_updating() && record.has_external_identity();
        if skip {
            self.deps.correlations.unmap(record).await?;
        }
        Ok(skip)
    }

    /// The registry does not know this object: drop its identity, report it
    /// and queue it to be exported again.
    pub async fn missing(
        &mut self,
        record: &mut CorrelationRecord,
        reason: &str,
    ) -> Result<(), RegistryError> {
        self.deps.correlations.reset(record).await?;

        if !self.record.missing_ids.contains(&record.object_id) {
            self.record.missing_ids.push(record.object_id.clone());
        }
        self.record.push_error(format!("{}: {reason}", record.key()));

        let first_time = self.missing_seen.insert(record.key().to_string());
        if self.deps.config.export_missing && first_time {
            if let Err(err) = self
                .deps
                .queue
                .enqueue(
                    record.object_type.clone(),
                    &record.object_id,
                    record.house_id.as_deref(),
                    None,
                )
                .await
            {
                warn!(key = %record.key(), error = %err, "Failed to re-queue missing object");
            }
        } else {
            warn!(key = %record.key(), reason, "Object unknown to the registry");
        }
        Ok(())
    }

    /// Record item-level errors against the matching correlation record.
    pub async fn issue(
        &mut self,
        transport_id: &str,
        errors: &[ItemError],
        known: &mut HashMap<String, CorrelationRecord>,
    ) -> Result<(), RegistryError> {
        let message = errors.iter().map(ItemError::message).collect::<Vec<_>>().join("; ");

        let Some(record) = known.get_mut(transport_id) else {
            warn!(transport_id, message = %message, "Error for an item not in this batch");
            return Ok(());
        };

        self.deps.correlations.mark_error(record, &message).await?;
        self.record.push_error(format!("{}: {message}", record.key()));
        Ok(())
    }

    /// Match result items to records and route their errors.
    ///
    /// Returns the successful items; errors, warnings and missing objects are
    /// applied as a side effect.
    pub async fn parse(
        &mut self,
        result: RegistryResult,
        known: &mut HashMap<String, CorrelationRecord>,
    ) -> Result<Vec<SuccessItem>, RegistryError> {
        if let Some(error) = result.error {
            return Err(ExternalBusinessError::from(error).into());
        }

        let warning_codes = self.deps.config.warning_codes.clone();
        let missing_codes = self.deps.config.missing_codes.clone();

        let mut successes = Vec::new();
        for FlatItem { item, group_id } in self.flatten(result.items) {
            let Some(transport_id) = item.transport_id else {
                warn!(errors = item.errors.len(), "Result item without transport id");
                continue;
            };

            let (warnings, errors): (Vec<ItemError>, Vec<ItemError>) = item
                .errors
                .into_iter()
                .partition(|e| warning_codes.iter().any(|code| code == &e.code));

            if let Some(record) = known.get(&transport_id) {
                let key = record.key();
                for warning in &warnings {
                    self.record.push_warning(format!("{key}: {}", warning.message()));
                }
            }

            if !errors.is_empty() {
                let missing = errors.iter().any(|e| missing_codes.iter().any(|c| c == &e.code));
                if missing && known.contains_key(&transport_id) {
                    let reason =
                        errors.iter().map(ItemError::message).collect::<Vec<_>>().join("; ");
                    if let Some(record) = known.get_mut(&transport_id) {
                        self.missing(record, &reason).await?;
                    }
                } else {
                    self.issue(&transport_id, &errors, known).await?;
                }
                continue;
            }

            match (known.get(&transport_id), item.success) {
                (Some(record), Some(success)) => {
                    successes.push(SuccessItem { record: record.clone(), success, group_id });
                }
                (None, Some(_)) => {
                    warn!(transport_id = %transport_id, "Result for an item not in this batch");
                }
                (Some(record), None) if warnings.is_empty() => {
                    let key = record.key();
                    self.record.push_warning(format!("{key}: empty result"));
                }
                _ => {}
            }
        }

        debug!(successes = successes.len(), "Parsed registry result");
        Ok(successes)
    }

    /// Persist successful items; returns how many were written.
    pub async fn store(&mut self, items: Vec<SuccessItem>) -> Result<usize, RegistryError> {
        let mut seen = HashSet::new();
        let mut stored = 0;

        for SuccessItem { mut record, success, group_id } in items {
            let Some(transport_id) = record.transport_id.clone() else {
                continue;
            };
            if !seen.insert(transport_id) {
                continue;
            }

            if self.kind.is_import() {
                self.deps.imports.store_item(&record, &success, group_id.as_deref()).await?;
            }

            let saved_at = success.modified_at.map(|at| at.timestamp()).unwrap_or_else(unix_now);
            let written = self
                .deps
                .correlations
                .mark_saved(
                    &mut record,
                    success.external_id.clone(),
                    success.code.clone(),
                    saved_at,
                )
                .await?;
            if written {
                stored += 1;
            }
        }
        Ok(stored)
    }

    /// Final status; exports hand missing objects to a secondary import.
    pub async fn conclude(&mut self) -> Result<OperationStatus, RegistryError> {
        if !self.kind.is_import()
            && self.deps.config.export_missing
            && !self.record.missing_ids.is_empty()
        {
            match self
                .deps
                .imports
                .import_missing(&self.record.object_type, &self.record.missing_ids)
                .await
            {
                Ok(true) => debug!(count = self.record.missing_ids.len(), "Started missing import"),
                Ok(false) => warn!(
                    object_type = %self.record.object_type,
                    "No secondary import for missing objects"
                ),
                Err(err) => warn!(error = %err, "Secondary import for missing objects failed"),
            }
        }

        self.release_locks().await;
        Ok(self.record.concluded_status())
    }

    fn flatten(&mut self, items: Vec<ResultItem>) -> Vec<FlatItem> {
        match self.kind {
            OperationKind::NestedImport => {
                let mut flat = Vec::new();
                for group in items {
                    for error in &group.errors {
                        self.record.push_error(format!("group: {}", error.message()));
                    }
                    let group_id = group.transport_id;
                    flat.extend(
                        group
                            .children
                            .into_iter()
                            .map(|item| FlatItem { item, group_id: group_id.clone() }),
                    );
                }
                flat
            }
            OperationKind::GenericExport | OperationKind::GenericImport => {
                items.into_iter().map(|item| FlatItem { item, group_id: None }).collect()
            }
        }
    }
}
