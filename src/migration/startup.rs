//! In-process migration helpers for application startup

use crate::config::MigrationConfig;
use crate::connection::connect;
use crate::executor::PgExecutor;
use crate::migration::{run, Context, MigrationChain, MigrationError, RunReport, VersionGate};

/// Connect with `config.database_url` and apply `chain`.
///
/// Meant for the one deployment role that owns schema changes. Any error should stop
/// startup; [`MigrationError::is_retryable`] tells which ones are worth another attempt
/// (a rolling deploy whose other replica holds the ledger lock, a dropped connection).
///
/// # Example
///
/// ```rust,no_run
/// use tidemark::MigrationConfig;
/// use tidemark::migration::{startup_migrations, Context, MigrationChain};
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let chain: MigrationChain = MigrationChain::initial().append("addcol", |env| {
///         env.tx().execute("ALTER TABLE jobs ADD COLUMN owner TEXT", &[])?;
///         Ok(())
///     });
///
///     let config = MigrationConfig::load()?;
///     startup_migrations(&config, &Context::background(), &(), &chain)?;
///
///     // Continue with application startup...
///     Ok(())
/// }
/// ```
pub fn startup_migrations<O>(
    config: &MigrationConfig,
    ctx: &Context,
    object_client: &O,
    chain: &MigrationChain<O>,
) -> Result<RunReport, MigrationError> {
    let executor = PgExecutor::new(connect(&config.database_url)?);
    let report = run(ctx, &executor, object_client, chain)?;

    if report.is_noop() {
        log::debug!("No pending migrations to apply");
    } else {
        log::info!("Applied {} migration(s) on startup", report.applied_count());
    }

    Ok(report)
}

/// Connect with `config.database_url` and block until the database is at the
/// chain's final ordinal.
///
/// Polls every `config.poll_interval()`. `config.wait_timeout()`, when set, bounds the
/// wait on top of whatever deadline `ctx` already carries.
pub fn await_migrations<O>(
    config: &MigrationConfig,
    ctx: &Context,
    chain: &MigrationChain<O>,
) -> Result<(), MigrationError> {
    let ctx = match config.wait_timeout() {
        Some(timeout) => ctx.clone().with_timeout(timeout),
        None => ctx.clone(),
    };

    let executor = PgExecutor::new(connect(&config.database_url)?);
    VersionGate::new(config.poll_interval()).wait_for(&ctx, &executor, chain.ordinal())
}
