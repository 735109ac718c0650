//! VersionGate - block until the ledger reaches a given ordinal
//!
//! For processes that must not migrate themselves (passive replicas, workers started
//! alongside the migrator) but need the schema at a known version before serving.

use crate::migration::{Context, MigrationDatabase, MigrationError};
use std::cmp::Ordering;
use std::time::Duration;

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;
#[cfg(feature = "metrics")]
use crate::metrics::METRICS;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Shortest interval [`VersionGate::new`] accepts
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Polls the ledger on a fixed interval. Never writes to the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionGate {
    poll_interval: Duration,
}

impl Default for VersionGate {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

impl VersionGate {
    /// Intervals below [`MIN_POLL_INTERVAL`] are raised to it
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Wait until the highest recorded ordinal equals `target`.
    ///
    /// Keeps waiting while the ledger table is missing or behind `target`. Returns
    /// [`MigrationError::DatabaseAhead`] as soon as the ledger is past `target`: the
    /// database was migrated by a newer deployment than this binary. Returns
    /// [`MigrationError::Cancelled`] or [`MigrationError::DeadlineExceeded`] when `ctx`
    /// is done first.
    pub fn wait_for<D>(&self, ctx: &Context, db: &D, target: i64) -> Result<(), MigrationError>
    where
        D: MigrationDatabase,
    {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::wait_for_span(target).entered();

        let ticker = crossbeam_channel::tick(self.poll_interval);

        loop {
            ctx.check()?;

            #[cfg(feature = "metrics")]
            METRICS.record_gate_poll();

            if db.ledger_exists()? {
                let latest = db.latest_ordinal()?.unwrap_or(0);
                match latest.cmp(&target) {
                    Ordering::Equal => {
                        log::info!("database reached migration {}", target);
                        return Ok(());
                    }
                    Ordering::Greater => {
                        return Err(MigrationError::DatabaseAhead {
                            latest,
                            expected: target,
                        });
                    }
                    Ordering::Less => {
                        log::debug!("waiting for migration {}, database at {}", target, latest);
                    }
                }
            } else {
                log::debug!("waiting for migration {}, ledger table not created yet", target);
            }

            ctx.wait_on(&ticker)?;
        }
    }
}

/// [`VersionGate::wait_for`] with the default one-second poll interval
pub fn wait_for<D>(ctx: &Context, db: &D, target: i64) -> Result<(), MigrationError>
where
    D: MigrationDatabase,
{
    VersionGate::default().wait_for(ctx, db, target)
}
