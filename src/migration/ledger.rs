//! The `migrations` ledger table
//!
//! One row per applied step:
//!
//! ```sql
//! CREATE TABLE migrations (
//!     id         BIGINT PRIMARY KEY,         -- ordinal
//!     name       VARCHAR(250) NOT NULL,      -- lower-cased step name
//!     start_time TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
//!     end_time   TIMESTAMP
//! );
//! ```
//!
//! A row is inserted and finished inside the same transaction as the step's own work,
//! so a committed row always has `end_time` set.
//!
//! The applier and the version gate reach the ledger only through the
//! [`MigrationDatabase`] and [`LedgerTransaction`] traits. `PostgreSQL` implementations
//! live here; [`crate::test_helpers::MemoryDatabase`] is the in-memory one.

use crate::executor::{query_value, DbError, DbExecutor, PgExecutor};
use crate::transaction::Transaction;
use chrono::NaiveDateTime;

pub const LEDGER_TABLE: &str = "migrations";

/// Longest step name the `name` column holds, in characters
pub const MAX_NAME_LEN: usize = 250;

/// SQLSTATE `lock_not_available`, raised by `LOCK ... NOWAIT` and by `lock_timeout`
pub const LOCK_NOT_AVAILABLE: &str = "55P03";

/// SQLSTATEs a losing `CREATE TABLE IF NOT EXISTS` race ends with: `unique_violation`
/// on the catalog and `duplicate_table`
const CONCURRENT_CREATE: [&str; 2] = ["23505", "42P07"];

/// Bounds every lock wait of the bootstrap statements. The seed insert needs
/// `ROW EXCLUSIVE`, which queues behind another migrator's `EXCLUSIVE` lock.
const BOOTSTRAP_LOCK_TIMEOUT_SQL: &str = "SET LOCAL lock_timeout = '50ms'";

const CREATE_LEDGER_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS migrations (
        id BIGINT PRIMARY KEY,
        name VARCHAR(250) NOT NULL,
        start_time TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        end_time TIMESTAMP
    )
"#;

const SEED_LEDGER_SQL: &str = r#"
    INSERT INTO migrations (id, name, start_time, end_time)
    VALUES (0, 'init', CURRENT_TIMESTAMP, CURRENT_TIMESTAMP)
    ON CONFLICT DO NOTHING
"#;

const LOCK_LEDGER_SQL: &str = "LOCK TABLE migrations IN EXCLUSIVE MODE NOWAIT";

const RECORDED_NAME_SQL: &str = "SELECT name FROM migrations WHERE id = $1";

const INSERT_STARTED_SQL: &str =
    "INSERT INTO migrations (id, name, start_time) VALUES ($1, $2, clock_timestamp())";

const MARK_FINISHED_SQL: &str = "UPDATE migrations SET end_time = clock_timestamp() WHERE id = $1";

const LEDGER_EXISTS_SQL: &str = r#"
    SELECT EXISTS (
        SELECT FROM information_schema.tables
        WHERE table_schema = current_schema()
        AND table_name::text = $1
    )
"#;

const LATEST_ORDINAL_SQL: &str = "SELECT MAX(id) FROM migrations";

const LEDGER_ROWS_SQL: &str = "SELECT id, name, start_time, end_time FROM migrations ORDER BY id";

/// A row of the ledger table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerRow {
    pub ordinal: i64,
    pub name: String,
    pub start_time: NaiveDateTime,
    /// `None` only while the owning transaction is still open
    pub end_time: Option<NaiveDateTime>,
}

impl LedgerRow {
    /// Expected column order: `id`, `name`, `start_time`, `end_time`
    pub fn from_row(row: &may_postgres::Row) -> Result<Self, DbError> {
        let parse = |column: &str, e: may_postgres::Error| {
            DbError::ParseError(format!("ledger column '{column}': {e}"))
        };

        Ok(Self {
            ordinal: row.try_get(0).map_err(|e| parse("id", e))?,
            name: row.try_get(1).map_err(|e| parse("name", e))?,
            start_time: row.try_get(2).map_err(|e| parse("start_time", e))?,
            end_time: row.try_get(3).map_err(|e| parse("end_time", e))?,
        })
    }

    pub fn is_finished(&self) -> bool {
        self.end_time.is_some()
    }
}

/// A database the applier can open step transactions on and the gate can poll
pub trait MigrationDatabase {
    type Transaction: LedgerTransaction;

    fn begin(&self) -> Result<Self::Transaction, DbError>;

    /// Whether the ledger table has been created
    fn ledger_exists(&self) -> Result<bool, DbError>;

    /// Highest recorded ordinal, `None` for an empty ledger
    fn latest_ordinal(&self) -> Result<Option<i64>, DbError>;

    /// Every committed row, ordered by ordinal
    fn ledger_rows(&self) -> Result<Vec<LedgerRow>, DbError>;
}

/// Ledger operations inside one step's transaction
pub trait LedgerTransaction: DbExecutor {
    /// Create the ledger table and its seed row if either is missing, without
    /// waiting on other migrators.
    ///
    /// Returns `Ok(false)` when another transaction is creating the ledger or holds
    /// its lock. The transaction is unusable afterwards and must be rolled back.
    fn create_ledger_nowait(&self) -> Result<bool, DbError>;

    /// Take the transaction-scoped exclusive lock on the ledger without waiting.
    ///
    /// Returns `Ok(false)` when another transaction holds a conflicting lock.
    fn lock_ledger_nowait(&self) -> Result<bool, DbError>;

    /// Name recorded for `ordinal`, if a row exists
    fn recorded_name(&self, ordinal: i64) -> Result<Option<String>, DbError>;

    /// Insert the row for `ordinal` with `end_time` still unset
    fn insert_started(&self, ordinal: i64, name: &str) -> Result<(), DbError>;

    fn mark_finished(&self, ordinal: i64) -> Result<(), DbError>;

    fn commit(self) -> Result<(), DbError>;

    fn rollback(self) -> Result<(), DbError>;
}

/// True for the error `LOCK ... NOWAIT` raises when the lock is taken
pub fn is_lock_not_available(err: &DbError) -> bool {
    err.sql_state() == Some(LOCK_NOT_AVAILABLE)
}

/// True for errors the bootstrap statements end with when another migrator got
/// there first
pub fn is_concurrent_bootstrap(err: &DbError) -> bool {
    is_lock_not_available(err)
        || err
            .sql_state()
            .is_some_and(|state| CONCURRENT_CREATE.contains(&state))
}

impl MigrationDatabase for PgExecutor {
    type Transaction = Transaction;

    fn begin(&self) -> Result<Transaction, DbError> {
        PgExecutor::begin(self).map_err(DbError::from)
    }

    fn ledger_exists(&self) -> Result<bool, DbError> {
        query_value(self, LEDGER_EXISTS_SQL, &[&LEDGER_TABLE])
    }

    fn latest_ordinal(&self) -> Result<Option<i64>, DbError> {
        query_value(self, LATEST_ORDINAL_SQL, &[])
    }

    fn ledger_rows(&self) -> Result<Vec<LedgerRow>, DbError> {
        self.query_all(LEDGER_ROWS_SQL, &[])?
            .iter()
            .map(LedgerRow::from_row)
            .collect()
    }
}

impl LedgerTransaction for Transaction {
    fn create_ledger_nowait(&self) -> Result<bool, DbError> {
        self.execute(BOOTSTRAP_LOCK_TIMEOUT_SQL, &[])?;
        for sql in [CREATE_LEDGER_SQL, SEED_LEDGER_SQL] {
            match self.execute(sql, &[]) {
                Ok(_) => {}
                Err(e) if is_concurrent_bootstrap(&e) => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    fn lock_ledger_nowait(&self) -> Result<bool, DbError> {
        match self.execute(LOCK_LEDGER_SQL, &[]) {
            Ok(_) => Ok(true),
            Err(e) if is_lock_not_available(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn recorded_name(&self, ordinal: i64) -> Result<Option<String>, DbError> {
        let rows = self.query_all(RECORDED_NAME_SQL, &[&ordinal])?;
        rows.first()
            .map(|row| {
                row.try_get::<usize, String>(0)
                    .map_err(|e| DbError::ParseError(format!("ledger column 'name': {e}")))
            })
            .transpose()
    }

    fn insert_started(&self, ordinal: i64, name: &str) -> Result<(), DbError> {
        self.execute(INSERT_STARTED_SQL, &[&ordinal, &name])?;
        Ok(())
    }

    fn mark_finished(&self, ordinal: i64) -> Result<(), DbError> {
        let updated = self.execute(MARK_FINISHED_SQL, &[&ordinal])?;
        if updated != 1 {
            return Err(DbError::QueryError(format!(
                "expected to finish one ledger row for migration {ordinal}, updated {updated}"
            )));
        }
        Ok(())
    }

    fn commit(self) -> Result<(), DbError> {
        Transaction::commit(self).map_err(DbError::from)
    }

    fn rollback(self) -> Result<(), DbError> {
        Transaction::rollback(self).map_err(DbError::from)
    }
}
