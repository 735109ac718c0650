//! In-memory migration database for unit tests
//!
//! [`MemoryDatabase`] behaves like one `PostgreSQL` schema holding the `migrations`
//! ledger: changes made through a [`MemoryTransaction`] become visible to other
//! transactions only on commit, and the ledger lock is held until the transaction
//! commits, rolls back or is dropped. Bootstrap reports would-block the way the server
//! does: while another transaction is still creating the table, and while another
//! transaction holds the ledger lock (the seed insert queues behind it). Statements
//! step bodies execute are recorded verbatim, so tests can assert which ones ran.
//!
//! Enabled for this crate's own tests and, with the `test-helpers` feature, for
//! downstream crates.

use crate::executor::{DbError, DbExecutor};
use crate::migration::ledger::{self, LedgerRow, LedgerTransaction, MigrationDatabase};
use chrono::NaiveDateTime;
use may_postgres::types::ToSql;
use may_postgres::Row;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct State {
    table_exists: bool,
    rows: BTreeMap<i64, LedgerRow>,
    statements: Vec<String>,
    lock_owner: Option<u64>,
    lock_held_externally: bool,
    /// Transaction whose uncommitted `CREATE TABLE` made the ledger
    creating: Option<u64>,
    next_tx_id: u64,
    clock: i64,
    fail_next: Option<DbError>,
}

impl State {
    /// Logical clock; every call returns a strictly later timestamp
    fn now(&mut self) -> NaiveDateTime {
        self.clock += 1;
        NaiveDateTime::default() + chrono::Duration::microseconds(self.clock)
    }

    fn lock_held_by_other(&self, id: u64) -> bool {
        self.lock_held_externally || self.lock_owner.is_some_and(|owner| owner != id)
    }
}

/// Shared handle to an in-memory ledger. Clones see the same data.
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    state: Arc<Mutex<State>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Committed ledger rows, ordered by ordinal
    pub fn rows(&self) -> Vec<LedgerRow> {
        self.state().rows.values().cloned().collect()
    }

    /// Committed statements executed by step bodies, in commit order
    pub fn statements(&self) -> Vec<String> {
        self.state().statements.clone()
    }

    pub fn latest(&self) -> Option<i64> {
        self.state().rows.keys().next_back().copied()
    }

    pub fn table_exists(&self) -> bool {
        self.state().table_exists
    }

    /// Whether any transaction or [`LockHold`] currently owns the ledger lock
    pub fn is_locked(&self) -> bool {
        let state = self.state();
        state.lock_owner.is_some() || state.lock_held_externally
    }

    /// Hold the ledger lock as another process would, until the guard is dropped
    pub fn hold_lock(&self) -> LockHold {
        self.state().lock_held_externally = true;
        LockHold { db: self.clone() }
    }

    /// Make the next statement on any transaction fail with `error`. Ledger bootstrap
    /// counts as a statement.
    pub fn fail_next_statement(&self, error: DbError) {
        self.state().fail_next = Some(error);
    }
}

impl MigrationDatabase for MemoryDatabase {
    type Transaction = MemoryTransaction;

    fn begin(&self) -> Result<MemoryTransaction, DbError> {
        let id = {
            let mut state = self.state();
            state.next_tx_id += 1;
            state.next_tx_id
        };
        Ok(MemoryTransaction {
            db: self.clone(),
            id,
            pending: RefCell::default(),
        })
    }

    fn ledger_exists(&self) -> Result<bool, DbError> {
        Ok(self.table_exists())
    }

    fn latest_ordinal(&self) -> Result<Option<i64>, DbError> {
        if !self.table_exists() {
            return Err(missing_ledger());
        }
        Ok(self.latest())
    }

    fn ledger_rows(&self) -> Result<Vec<LedgerRow>, DbError> {
        if !self.table_exists() {
            return Err(missing_ledger());
        }
        Ok(self.rows())
    }
}

/// Releases the lock taken by [`MemoryDatabase::hold_lock`] on drop
pub struct LockHold {
    db: MemoryDatabase,
}

impl Drop for LockHold {
    fn drop(&mut self) {
        self.db.state().lock_held_externally = false;
    }
}

#[derive(Default)]
struct Pending {
    create_table: bool,
    /// Rows inserted or updated by this transaction, shadowing committed ones
    rows: BTreeMap<i64, LedgerRow>,
    statements: Vec<String>,
}

/// A transaction on a [`MemoryDatabase`]; dropping it without commit rolls back
pub struct MemoryTransaction {
    db: MemoryDatabase,
    id: u64,
    pending: RefCell<Pending>,
}

impl MemoryTransaction {
    fn table_visible(&self, state: &State) -> bool {
        state.table_exists || self.pending.borrow().create_table
    }

    fn visible_row(&self, state: &State, ordinal: i64) -> Option<LedgerRow> {
        self.pending
            .borrow()
            .rows
            .get(&ordinal)
            .or_else(|| state.rows.get(&ordinal))
            .cloned()
    }

    fn seed(&self, state: &mut State) {
        if self.visible_row(state, 0).is_none() {
            let now = state.now();
            self.pending.borrow_mut().rows.insert(
                0,
                LedgerRow {
                    ordinal: 0,
                    name: "init".to_string(),
                    start_time: now,
                    end_time: Some(now),
                },
            );
        }
    }

    fn release_locks(&self) {
        let mut state = self.db.state();
        if state.lock_owner == Some(self.id) {
            state.lock_owner = None;
        }
        if state.creating == Some(self.id) {
            state.creating = None;
        }
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        self.release_locks();
    }
}

impl DbExecutor for MemoryTransaction {
    fn execute(&self, query: &str, _params: &[&dyn ToSql]) -> Result<u64, DbError> {
        if let Some(error) = self.db.state().fail_next.take() {
            return Err(error);
        }
        self.pending.borrow_mut().statements.push(query.to_string());
        Ok(0)
    }

    fn query_one(&self, query: &str, _params: &[&dyn ToSql]) -> Result<Row, DbError> {
        Err(DbError::Other(format!(
            "MemoryTransaction cannot return rows for: {query}"
        )))
    }

    fn query_all(&self, query: &str, _params: &[&dyn ToSql]) -> Result<Vec<Row>, DbError> {
        Err(DbError::Other(format!(
            "MemoryTransaction cannot return rows for: {query}"
        )))
    }
}

impl LedgerTransaction for MemoryTransaction {
    fn create_ledger_nowait(&self) -> Result<bool, DbError> {
        let mut state = self.db.state();
        if let Some(error) = state.fail_next.take() {
            return Err(error);
        }

        if !self.table_visible(&state) {
            if state.creating.is_some() {
                return Ok(false);
            }
            state.creating = Some(self.id);
            self.pending.borrow_mut().create_table = true;
        } else if state.lock_held_by_other(self.id) {
            return Ok(false);
        }

        self.seed(&mut state);
        Ok(true)
    }

    fn lock_ledger_nowait(&self) -> Result<bool, DbError> {
        let mut state = self.db.state();
        if !self.table_visible(&state) {
            return Err(missing_ledger());
        }
        if state.lock_held_by_other(self.id) {
            return Ok(false);
        }
        state.lock_owner = Some(self.id);
        Ok(true)
    }

    fn recorded_name(&self, ordinal: i64) -> Result<Option<String>, DbError> {
        let state = self.db.state();
        if !self.table_visible(&state) {
            return Err(missing_ledger());
        }
        Ok(self.visible_row(&state, ordinal).map(|row| row.name))
    }

    fn insert_started(&self, ordinal: i64, name: &str) -> Result<(), DbError> {
        let mut state = self.db.state();
        if !self.table_visible(&state) {
            return Err(missing_ledger());
        }
        if self.visible_row(&state, ordinal).is_some() {
            return Err(DbError::QueryError(format!(
                "duplicate key value violates unique constraint \"migrations_pkey\": id={ordinal}"
            )));
        }
        let start_time = state.now();
        self.pending.borrow_mut().rows.insert(
            ordinal,
            LedgerRow {
                ordinal,
                name: name.to_string(),
                start_time,
                end_time: None,
            },
        );
        Ok(())
    }

    fn mark_finished(&self, ordinal: i64) -> Result<(), DbError> {
        let mut state = self.db.state();
        let mut row = self.visible_row(&state, ordinal).ok_or_else(|| {
            DbError::QueryError(format!(
                "expected to finish one ledger row for migration {ordinal}, updated 0"
            ))
        })?;
        row.end_time = Some(state.now());
        self.pending.borrow_mut().rows.insert(ordinal, row);
        Ok(())
    }

    fn commit(self) -> Result<(), DbError> {
        let pending = self.pending.take();
        let mut state = self.db.state();
        if pending.create_table {
            state.table_exists = true;
        }
        state.rows.extend(pending.rows);
        state.statements.extend(pending.statements);
        Ok(())
    }

    fn rollback(self) -> Result<(), DbError> {
        Ok(())
    }
}

fn missing_ledger() -> DbError {
    DbError::QueryError(format!("relation \"{}\" does not exist", ledger::LEDGER_TABLE))
}
