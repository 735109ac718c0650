//! The environment handed to each migration step

use crate::migration::Context;
use crate::DbExecutor;

/// What a migration step runs with.
///
/// `object_client` is the host service's shared auxiliary handle (object storage and the
/// like); the engine only passes it through. `tx` is the transaction the step's ledger
/// row lives in, so everything the step executes through it commits or rolls back with
/// that row.
pub struct Env<'a, O> {
    ctx: &'a Context,
    object_client: &'a O,
    tx: &'a dyn DbExecutor,
}

impl<'a, O> Env<'a, O> {
    pub fn new(ctx: &'a Context, object_client: &'a O, tx: &'a dyn DbExecutor) -> Self {
        Self {
            ctx,
            object_client,
            tx,
        }
    }

    pub fn ctx(&self) -> &'a Context {
        self.ctx
    }

    pub fn object_client(&self) -> &'a O {
        self.object_client
    }

    pub fn tx(&self) -> &'a dyn DbExecutor {
        self.tx
    }
}
