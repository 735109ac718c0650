//! Migration-specific error types

use crate::connection::ConnectionError;
use crate::DbError;

/// How a caller should react to a [`MigrationError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The process must not continue starting up
    Fatal,
    /// Retry the whole `run` (or `wait_for`) after a delay
    Retryable,
    /// The caller's context was cancelled or its deadline passed
    Cancelled,
}

/// Migration-specific errors
#[derive(Debug)]
pub enum MigrationError {
    /// Database execution error outside a step body
    Database(DbError),
    /// Could not open a connection
    Connection(ConnectionError),
    /// The bootstrap step could not create or seed the ledger table
    Bootstrap(DbError),
    /// The ledger lock is held by another transaction
    LockContention { ordinal: i64 },
    /// The ledger records a different step at this ordinal than the chain expects
    NameMismatch {
        ordinal: i64,
        recorded: String,
        expected: String,
    },
    /// A step name does not fit the ledger's `name` column
    NameTooLong { ordinal: i64, len: usize },
    /// A step body returned an error; the step's transaction was rolled back
    Step {
        ordinal: i64,
        name: String,
        error: DbError,
    },
    /// The ledger is past the ordinal this binary expects
    DatabaseAhead { latest: i64, expected: i64 },
    /// The context was cancelled
    Cancelled,
    /// The context deadline passed
    DeadlineExceeded,
}

impl MigrationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MigrationError::Bootstrap(_)
            | MigrationError::NameMismatch { .. }
            | MigrationError::NameTooLong { .. }
            | MigrationError::DatabaseAhead { .. } => ErrorKind::Fatal,
            MigrationError::Database(_)
            | MigrationError::Connection(_)
            | MigrationError::LockContention { .. }
            | MigrationError::Step { .. } => ErrorKind::Retryable,
            MigrationError::Cancelled | MigrationError::DeadlineExceeded => ErrorKind::Cancelled,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Retryable
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }

    /// True when another process holds the ledger lock
    pub fn is_contention(&self) -> bool {
        matches!(self, MigrationError::LockContention { .. })
    }
}

impl std::fmt::Display for MigrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationError::Database(e) => write!(f, "Database error: {}", e),
            MigrationError::Connection(e) => write!(f, "Connection error: {}", e),
            MigrationError::Bootstrap(e) => {
                write!(
                    f,
                    "Failed to bootstrap the migrations ledger: {}\n\
                     Migrations cannot run without the ledger table.",
                    e
                )
            }
            MigrationError::LockContention { ordinal } => {
                write!(
                    f,
                    "Migration {} could not lock the migrations table: another process is migrating. \
                     Retry after a delay.",
                    ordinal
                )
            }
            MigrationError::NameMismatch {
                ordinal,
                recorded,
                expected,
            } => {
                write!(
                    f,
                    "migration mismatch {} HAVE: {} WANT: {}\n\
                     The database history disagrees with the migrations compiled into this binary.",
                    ordinal, recorded, expected
                )
            }
            MigrationError::NameTooLong { ordinal, len } => {
                write!(
                    f,
                    "Migration {} has a {}-character name; the ledger holds at most {}",
                    ordinal,
                    len,
                    crate::migration::ledger::MAX_NAME_LEN
                )
            }
            MigrationError::Step {
                ordinal,
                name,
                error,
            } => {
                write!(f, "Migration {} '{}' failed: {}", ordinal, name, error)
            }
            MigrationError::DatabaseAhead { latest, expected } => {
                write!(
                    f,
                    "database state is newer than application is expecting \
                     (ledger at {}, expected {})",
                    latest, expected
                )
            }
            MigrationError::Cancelled => write!(f, "context cancelled"),
            MigrationError::DeadlineExceeded => write!(f, "context deadline exceeded"),
        }
    }
}

impl std::error::Error for MigrationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MigrationError::Database(e) | MigrationError::Bootstrap(e) => Some(e),
            MigrationError::Step { error, .. } => Some(error),
            MigrationError::Connection(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DbError> for MigrationError {
    fn from(error: DbError) -> Self {
        MigrationError::Database(error)
    }
}

impl From<ConnectionError> for MigrationError {
    fn from(error: ConnectionError) -> Self {
        MigrationError::Connection(error)
    }
}
