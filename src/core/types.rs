use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of an aggregate row (for example a stock item).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(pub u64);

impl ResourceId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for ResourceId {
    fn from(value: u64) -> Self {
        ResourceId(value)
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "res_{}", self.0)
    }
}

/// Opaque identifier of the actor that created a contribution.
///
/// Carried for audit only; the locking protocol never looks at it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerId(pub String);

impl OwnerId {
    pub fn new(owner: impl Into<String>) -> Self {
        OwnerId(owner.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContributionId(pub Uuid);

impl ContributionId {
    pub fn new() -> Self {
        ContributionId(Uuid::new_v4())
    }
}

impl Default for ContributionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ContributionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Committed state of one aggregate row, as returned to readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateRow {
    pub resource_id: ResourceId,
    pub total: u64,
    /// Number of committed writes since the row was created
    pub version: u64,
}
