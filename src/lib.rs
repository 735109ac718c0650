//! # Tidemark
//!
//! Ordered, exactly-once schema migrations for `PostgreSQL` services built on the `may`
//! coroutine runtime.
//!
//! A service declares its schema history as a [`migration::MigrationChain`]. One
//! deployment role applies it with [`migration::run`] (each step in its own transaction,
//! guarded by a `NOWAIT` lock on the `migrations` ledger table); every other role blocks
//! in [`migration::wait_for`] until the ledger reaches the chain's final ordinal.
//!
//! See the [`migration`] module for an end-to-end example.

pub mod config;
pub mod connection;
pub mod executor;
#[cfg(any(feature = "metrics", feature = "tracing"))]
pub mod metrics;
pub mod migration;
pub mod transaction;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use config::MigrationConfig;
pub use connection::{connect, ConnectionError};
pub use executor::{DbError, DbExecutor, PgExecutor};
pub use transaction::{Transaction, TransactionError};
