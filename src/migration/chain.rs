//! The ordered, append-only chain of migration steps
//!
//! ```rust
//! use tidemark::migration::MigrationChain;
//!
//! let chain: MigrationChain = MigrationChain::initial()
//!     .append("AddCol", |env| {
//!         env.tx().execute("ALTER TABLE jobs ADD COLUMN owner TEXT", &[])?;
//!         Ok(())
//!     })
//!     .append("AddIndex", |env| {
//!         env.tx().execute("CREATE INDEX jobs_owner_idx ON jobs (owner)", &[])?;
//!         Ok(())
//!     });
//!
//! assert_eq!(chain.ordinal(), 2);
//! assert_eq!(chain.name(), "addindex");
//! ```

use crate::migration::Env;
use crate::DbError;
use std::fmt;

/// Body of a migration step
pub type StepAction<O> = Box<dyn Fn(&Env<'_, O>) -> Result<(), DbError> + Send + Sync>;

pub const BOOTSTRAP_ORDINAL: i64 = 0;
pub const BOOTSTRAP_NAME: &str = "init";

pub struct MigrationStep<O> {
    ordinal: i64,
    name: String,
    action: StepAction<O>,
}

impl<O> MigrationStep<O> {
    pub fn ordinal(&self) -> i64 {
        self.ordinal
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The ordinal-0 step that creates the ledger itself
    pub fn is_bootstrap(&self) -> bool {
        self.ordinal == BOOTSTRAP_ORDINAL
    }

    pub(crate) fn run(&self, env: &Env<'_, O>) -> Result<(), DbError> {
        (self.action)(env)
    }
}

impl<O> fmt::Debug for MigrationStep<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationStep")
            .field("ordinal", &self.ordinal)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Migration steps in the order they were built.
///
/// Built once at startup and never changed afterwards. The order is permanent once
/// deployed: inserting or reordering steps is reported as a name mismatch when the
/// chain is applied to a database that already recorded the old order.
pub struct MigrationChain<O = ()> {
    steps: Vec<MigrationStep<O>>,
}

impl<O: 'static> MigrationChain<O> {
    /// A chain holding only the bootstrap step
    pub fn initial() -> Self {
        Self {
            steps: vec![MigrationStep {
                ordinal: BOOTSTRAP_ORDINAL,
                name: BOOTSTRAP_NAME.to_string(),
                action: Box::new(bootstrap::<O>),
            }],
        }
    }

    /// Extend the chain with the next step. `name` is stored lower-cased.
    ///
    /// Names longer than [`MAX_NAME_LEN`](crate::migration::ledger::MAX_NAME_LEN)
    /// characters do not fit the ledger; [`run`](crate::migration::run) rejects such a
    /// chain before touching the database.
    pub fn append<F>(mut self, name: &str, action: F) -> Self
    where
        F: Fn(&Env<'_, O>) -> Result<(), DbError> + Send + Sync + 'static,
    {
        let ordinal = self.ordinal() + 1;
        self.steps.push(MigrationStep {
            ordinal,
            name: name.to_lowercase(),
            action: Box::new(action),
        });
        self
    }
}

impl<O> MigrationChain<O> {
    /// Ordinal of the last step
    pub fn ordinal(&self) -> i64 {
        self.last().ordinal
    }

    /// Name of the last step
    pub fn name(&self) -> &str {
        &self.last().name
    }

    pub fn last(&self) -> &MigrationStep<O> {
        // `initial()` is the only constructor and it always pushes the bootstrap step.
        &self.steps[self.steps.len() - 1]
    }

    /// Steps from the bootstrap step to the last one
    pub fn steps(&self) -> &[MigrationStep<O>] {
        &self.steps
    }

    pub fn get(&self, ordinal: i64) -> Option<&MigrationStep<O>> {
        usize::try_from(ordinal).ok().and_then(|idx| self.steps.get(idx))
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl<O> fmt::Debug for MigrationChain<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.steps.iter()).finish()
    }
}

/// The applier creates the ledger for ordinal 0 through
/// [`LedgerTransaction::create_ledger_nowait`](crate::migration::LedgerTransaction::create_ledger_nowait)
fn bootstrap<O>(_: &Env<'_, O>) -> Result<(), DbError> {
    Ok(())
}
