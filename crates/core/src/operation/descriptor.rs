//! Service descriptor: operation names to implementations.

use std::collections::BTreeMap;

use regsync_domain::{ObjectType, RegSyncError, Result};

use super::kinds::OperationKind;

/// Implementation bound to an operation name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationBinding {
    pub kind: OperationKind,
    pub object_type: ObjectType,
}

/// Registry service and the operations it offers.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    service: String,
    bindings: BTreeMap<String, OperationBinding>,
}

impl ServiceDescriptor {
    pub fn new(service: impl Into<String>) -> Self {
        Self { service: service.into(), bindings: BTreeMap::new() }
    }

    pub fn register(
        mut self,
        name: impl Into<String>,
        kind: OperationKind,
        object_type: ObjectType,
    ) -> Self {
        self.bindings.insert(name.into(), OperationBinding { kind, object_type });
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn resolve(&self, name: &str) -> Result<&OperationBinding> {
        self.bindings.get(name).ok_or_else(|| {
            RegSyncError::NotFound(format!(
                "operation '{name}' is not offered by service '{}'",
                self.service
            ))
        })
    }

    /// Export operation used when the queue distributes `object_type`.
    pub fn export_operation_for(&self, object_type: &ObjectType) -> Option<&str> {
        self.bindings
            .iter()
            .find(|(_, b)| &b.object_type == object_type && !b.kind.is_import())
            .map(|(name, _)| name.as_str())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.bindings.keys().map(String::as_str)
    }
}
