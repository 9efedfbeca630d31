// ============================================================================
// Transaction Change Tracking
// ============================================================================
//
// Implements the Command Pattern for buffered writes.
// Each Change is recorded while the transaction runs and is either
// applied as a whole at COMMIT or discarded at ROLLBACK.
//
// ============================================================================

use crate::core::{ContributionId, ResourceId};

/// A single buffered change in a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// Overwrite the total of a locked aggregate row
    WriteTotal {
        resource: ResourceId,
        old_total: u64,
        new_total: u64,
    },

    /// Create a new aggregate row
    CreateResource {
        resource: ResourceId,
        initial_total: u64,
    },

    /// Delete a locked aggregate row
    DeleteResource { resource: ResourceId },

    /// Record that a contribution has been folded into its aggregate
    MarkApplied { contribution: ContributionId },
}

impl Change {
    /// The aggregate row this change touches, if any
    pub fn resource(&self) -> Option<ResourceId> {
        match self {
            Change::WriteTotal { resource, .. }
            | Change::CreateResource { resource, .. }
            | Change::DeleteResource { resource } => Some(*resource),
            Change::MarkApplied { .. } => None,
        }
    }

    /// Check if this change alters which rows exist
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Change::CreateResource { .. } | Change::DeleteResource { .. }
        )
    }
}
