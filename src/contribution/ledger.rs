use super::ContributionRecord;
use crate::core::{ContributionId, DbError, ResourceId, Result};
use crate::transaction::Change;
use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockWriteGuard};

/// Append-only log of contribution records.
///
/// Records are never modified. Whether a record has been folded into its
/// aggregate is tracked beside it and flipped only by a committing
/// transaction, in the same critical section as the aggregate write.
#[derive(Default)]
pub struct ContributionLedger {
    state: RwLock<LedgerState>,
}

#[derive(Default)]
pub(crate) struct LedgerState {
    records: Vec<ContributionRecord>,
    index: HashMap<ContributionId, usize>,
    applied: HashSet<ContributionId>,
}

impl ContributionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, record: ContributionRecord) -> Result<()> {
        let mut state = self.state.write()?;
        let position = state.records.len();
        state.index.insert(record.id(), position);
        state.records.push(record);
        Ok(())
    }

    pub fn get(&self, id: ContributionId) -> Result<ContributionRecord> {
        let state = self.state.read()?;
        state
            .index
            .get(&id)
            .map(|&position| state.records[position].clone())
            .ok_or(DbError::ContributionNotFound(id))
    }

    pub fn is_applied(&self, id: ContributionId) -> Result<bool> {
        Ok(self.state.read()?.applied.contains(&id))
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.state.read()?.records.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Records that were created but never applied, in creation order
    pub fn unapplied(&self) -> Result<Vec<ContributionRecord>> {
        let state = self.state.read()?;
        Ok(state
            .records
            .iter()
            .filter(|record| !state.applied.contains(&record.id()))
            .cloned()
            .collect())
    }

    /// Sum of applied quantities for one resource
    pub fn applied_total(&self, resource: ResourceId) -> Result<u64> {
        let state = self.state.read()?;
        Ok(state
            .records
            .iter()
            .filter(|record| record.resource_id() == resource)
            .filter(|record| state.applied.contains(&record.id()))
            .map(ContributionRecord::quantity)
            .sum())
    }

    /// Fail fast when a record cannot be marked applied.
    pub fn check_markable(&self, id: ContributionId) -> Result<()> {
        self.state.read()?.check_markable(id)
    }

    pub(crate) fn lock_for_commit(&self) -> Result<RwLockWriteGuard<'_, LedgerState>> {
        Ok(self.state.write()?)
    }
}

impl LedgerState {
    fn check_markable(&self, id: ContributionId) -> Result<()> {
        if !self.index.contains_key(&id) {
            return Err(DbError::ContributionNotFound(id));
        }
        if self.applied.contains(&id) {
            return Err(DbError::AlreadyApplied(id));
        }
        Ok(())
    }

    pub(crate) fn validate(&self, changes: &[Change]) -> Result<()> {
        let mut marked = HashSet::new();
        for change in changes {
            if let Change::MarkApplied { contribution } = change {
                self.check_markable(*contribution)?;
                if !marked.insert(*contribution) {
                    return Err(DbError::AlreadyApplied(*contribution));
                }
            }
        }
        Ok(())
    }

    pub(crate) fn apply(&mut self, changes: &[Change]) {
        for change in changes {
            if let Change::MarkApplied { contribution } = change {
                self.applied.insert(*contribution);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::OwnerId;

    fn record(resource: u64, quantity: u64) -> ContributionRecord {
        ContributionRecord::new(ResourceId(resource), quantity, OwnerId::new("tester")).unwrap()
    }

    #[test]
    fn test_appended_records_start_unapplied() {
        let ledger = ContributionLedger::new();
        let first = record(1, 5);
        let second = record(1, 7);
        ledger.append(first.clone()).unwrap();
        ledger.append(second.clone()).unwrap();

        assert_eq!(ledger.len().unwrap(), 2);
        assert_eq!(ledger.unapplied().unwrap(), vec![first.clone(), second]);
        assert_eq!(ledger.get(first.id()).unwrap(), first);
    }

    #[test]
    fn test_mark_applied_via_commit_batch() {
        let ledger = ContributionLedger::new();
        let applied = record(1, 5);
        let pending = record(2, 3);
        ledger.append(applied.clone()).unwrap();
        ledger.append(pending.clone()).unwrap();

        let batch = [Change::MarkApplied {
            contribution: applied.id(),
        }];
        {
            let mut state = ledger.lock_for_commit().unwrap();
            state.validate(&batch).unwrap();
            state.apply(&batch);
        }

        assert!(ledger.is_applied(applied.id()).unwrap());
        assert_eq!(ledger.unapplied().unwrap(), vec![pending]);
        assert_eq!(ledger.applied_total(ResourceId(1)).unwrap(), 5);
        assert!(matches!(
            ledger.check_markable(applied.id()),
            Err(DbError::AlreadyApplied(_))
        ));
    }

    #[test]
    fn test_unknown_contribution_is_not_markable() {
        let ledger = ContributionLedger::new();
        let stray = record(1, 1);
        assert!(matches!(
            ledger.check_markable(stray.id()),
            Err(DbError::ContributionNotFound(_))
        ));
    }
}
