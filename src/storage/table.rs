use crate::core::{AggregateRow, DbError, ResourceId, Result};
use crate::transaction::Change;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Committed aggregate rows, keyed by resource.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregateTable {
    rows: BTreeMap<ResourceId, AggregateRow>,
}

impl AggregateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, resource: ResourceId) -> Option<&AggregateRow> {
        self.rows.get(&resource)
    }

    pub fn contains(&self, resource: ResourceId) -> bool {
        self.rows.contains_key(&resource)
    }

    pub fn rows(&self) -> impl Iterator<Item = &AggregateRow> {
        self.rows.values()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Check that a batch of changes can be applied in order.
    ///
    /// Runs against a simulated view of row existence so that a batch which
    /// creates and then writes a row validates, while a write to a row that
    /// was deleted underneath the transaction does not.
    pub fn validate(&self, changes: &[Change]) -> Result<()> {
        let mut created: HashSet<ResourceId> = HashSet::new();
        let mut deleted: HashSet<ResourceId> = HashSet::new();

        let exists = |resource: &ResourceId,
                      created: &HashSet<ResourceId>,
                      deleted: &HashSet<ResourceId>| {
            !deleted.contains(resource) && (created.contains(resource) || self.contains(*resource))
        };

        for change in changes {
            match change {
                Change::CreateResource { resource, .. } => {
                    if exists(resource, &created, &deleted) {
                        return Err(DbError::ResourceExists(*resource));
                    }
                    deleted.remove(resource);
                    created.insert(*resource);
                }
                Change::WriteTotal { resource, .. } => {
                    if !exists(resource, &created, &deleted) {
                        return Err(DbError::ResourceNotFound(*resource));
                    }
                }
                Change::DeleteResource { resource } => {
                    if !exists(resource, &created, &deleted) {
                        return Err(DbError::ResourceNotFound(*resource));
                    }
                    created.remove(resource);
                    deleted.insert(*resource);
                }
                Change::MarkApplied { .. } => {}
            }
        }
        Ok(())
    }

    /// Apply a batch previously accepted by [`AggregateTable::validate`].
    pub fn apply(&mut self, changes: &[Change]) {
        for change in changes {
            match change {
                Change::CreateResource {
                    resource,
                    initial_total,
                } => {
                    self.rows.insert(
                        *resource,
                        AggregateRow {
                            resource_id: *resource,
                            total: *initial_total,
                            version: 0,
                        },
                    );
                }
                Change::WriteTotal {
                    resource,
                    new_total,
                    ..
                } => {
                    if let Some(row) = self.rows.get_mut(resource) {
                        row.total = *new_total;
                        row.version += 1;
                    }
                }
                Change::DeleteResource { resource } => {
                    self.rows.remove(resource);
                }
                Change::MarkApplied { .. } => {}
            }
        }
    }
}
