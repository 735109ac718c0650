//! Migration status - compare a chain against what the ledger recorded

use crate::migration::{LedgerRow, MigrationChain, MigrationDatabase, MigrationError};

/// Where a database stands relative to a chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
    /// Ledger rows, ordered by ordinal
    pub applied: Vec<LedgerRow>,

    /// Chain steps with no ledger row yet, in chain order
    pub pending: Vec<PendingStep>,
}

/// A chain step the database has not recorded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingStep {
    pub ordinal: i64,
    pub name: String,
}

impl MigrationStatus {
    #[must_use]
    pub fn is_up_to_date(&self) -> bool {
        self.pending.is_empty()
    }

    #[must_use]
    pub fn latest_applied_ordinal(&self) -> Option<i64> {
        self.applied.last().map(|row| row.ordinal)
    }

    #[must_use]
    pub fn next_pending_ordinal(&self) -> Option<i64> {
        self.pending.first().map(|step| step.ordinal)
    }
}

/// Read the ledger and classify every step of `chain` as applied or pending.
///
/// Read-only. A missing ledger table leaves every step pending, bootstrap included.
/// Fails with [`MigrationError::NameMismatch`] when a recorded name differs from the
/// chain's, and with [`MigrationError::DatabaseAhead`] when the ledger holds ordinals
/// past the end of the chain.
pub fn status<D, O>(db: &D, chain: &MigrationChain<O>) -> Result<MigrationStatus, MigrationError>
where
    D: MigrationDatabase,
{
    let applied = if db.ledger_exists()? {
        db.ledger_rows()?
    } else {
        Vec::new()
    };

    if let Some(last) = applied.last() {
        if last.ordinal > chain.ordinal() {
            return Err(MigrationError::DatabaseAhead {
                latest: last.ordinal,
                expected: chain.ordinal(),
            });
        }
    }

    for row in &applied {
        if let Some(step) = chain.get(row.ordinal) {
            if step.name() != row.name {
                return Err(MigrationError::NameMismatch {
                    ordinal: row.ordinal,
                    recorded: row.name.clone(),
                    expected: step.name().to_string(),
                });
            }
        }
    }

    let pending = chain
        .steps()
        .iter()
        .filter(|step| !applied.iter().any(|row| row.ordinal == step.ordinal()))
        .map(|step| PendingStep {
            ordinal: step.ordinal(),
            name: step.name().to_string(),
        })
        .collect();

    Ok(MigrationStatus { applied, pending })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::{run, Context};
    use crate::test_helpers::MemoryDatabase;

    fn chain(names: &[&str]) -> MigrationChain {
        names
            .iter()
            .fold(MigrationChain::initial(), |chain, name| chain.append(name, |_| Ok(())))
    }

    #[test]
    fn test_missing_ledger_leaves_everything_pending() {
        let db = MemoryDatabase::new();
        let status = status(&db, &chain(&["addcol", "addindex"])).unwrap();

        assert!(status.applied.is_empty());
        assert_eq!(
            status.pending.iter().map(|p| p.ordinal).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(status.next_pending_ordinal(), Some(0));
        assert_eq!(status.latest_applied_ordinal(), None);
        assert!(!db.table_exists(), "status must not create the ledger");
    }

    #[test]
    fn test_partially_applied() {
        let db = MemoryDatabase::new();
        run(&Context::background(), &db, &(), &chain(&["addcol"])).unwrap();

        let status = status(&db, &chain(&["addcol", "addindex"])).unwrap();
        assert_eq!(status.latest_applied_ordinal(), Some(1));
        assert_eq!(
            status.pending,
            vec![PendingStep {
                ordinal: 2,
                name: "addindex".to_string()
            }]
        );
        assert!(!status.is_up_to_date());
    }

    #[test]
    fn test_up_to_date() {
        let db = MemoryDatabase::new();
        let full = chain(&["addcol", "addindex"]);
        run(&Context::background(), &db, &(), &full).unwrap();

        let status = status(&db, &full).unwrap();
        assert!(status.is_up_to_date());
        assert_eq!(status.applied.len(), 3);
    }

    #[test]
    fn test_renamed_step_is_a_mismatch() {
        let db = MemoryDatabase::new();
        run(&Context::background(), &db, &(), &chain(&["addcol"])).unwrap();

        let err = status(&db, &chain(&["addindex"])).unwrap_err();
        assert!(matches!(err, MigrationError::NameMismatch { ordinal: 1, .. }));
    }

    #[test]
    fn test_ledger_past_chain_is_ahead() {
        let db = MemoryDatabase::new();
        run(&Context::background(), &db, &(), &chain(&["addcol", "addindex"])).unwrap();

        let err = status(&db, &chain(&["addcol"])).unwrap_err();
        assert!(matches!(err, MigrationError::DatabaseAhead { latest: 2, expected: 1 }));
    }
}
