//! Cancellation and deadlines for migration calls
//!
//! A [`Context`] carries an optional cancel channel and an optional deadline. Cancelling
//! closes the channel, which wakes every clone of the context at once.

use crate::migration::MigrationError;
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default)]
pub struct Context {
    cancel: Option<Receiver<()>>,
    deadline: Option<Instant>,
}

/// Cancels the [`Context`] it was created with.
///
/// Dropping the handle also cancels, so keep it alive for as long as the
/// context should stay live.
#[derive(Debug)]
pub struct CancelHandle {
    _tx: Sender<()>,
}

impl CancelHandle {
    pub fn cancel(self) {}
}

impl Context {
    /// A context that is never cancelled and has no deadline
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_cancel() -> (Self, CancelHandle) {
        let (tx, rx) = crossbeam_channel::bounded(0);
        (
            Self {
                cancel: Some(rx),
                deadline: None,
            },
            CancelHandle { _tx: tx },
        )
    }

    /// Keeps the earlier of the existing deadline and `deadline`
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The reason this context is done, if it is
    pub fn err(&self) -> Option<MigrationError> {
        if let Some(rx) = &self.cancel {
            if let Err(TryRecvError::Disconnected) = rx.try_recv() {
                return Some(MigrationError::Cancelled);
            }
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(MigrationError::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn check(&self) -> Result<(), MigrationError> {
        match self.err() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Block until `interval` elapses or the context is done, whichever comes first
    pub fn sleep(&self, interval: Duration) -> Result<(), MigrationError> {
        self.wait_on(&crossbeam_channel::after(interval))
    }

    /// Block until `ready` yields or the context is done
    pub(crate) fn wait_on<T>(&self, ready: &Receiver<T>) -> Result<(), MigrationError> {
        let cancel = self.cancel.clone().unwrap_or_else(crossbeam_channel::never);
        let deadline = self
            .deadline
            .map(crossbeam_channel::at)
            .unwrap_or_else(crossbeam_channel::never);

        crossbeam_channel::select! {
            recv(cancel) -> _ => Err(MigrationError::Cancelled),
            recv(deadline) -> _ => Err(MigrationError::DeadlineExceeded),
            recv(ready) -> _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_background_is_never_done() {
        let ctx = Context::background();
        assert!(ctx.err().is_none());
        assert!(ctx.sleep(Duration::from_millis(1)).is_ok());
    }

    #[test]
    fn test_cancel_wakes_every_clone() {
        let (ctx, handle) = Context::with_cancel();
        let clone = ctx.clone();
        assert!(ctx.check().is_ok());

        handle.cancel();

        assert!(matches!(ctx.err(), Some(MigrationError::Cancelled)));
        assert!(matches!(clone.err(), Some(MigrationError::Cancelled)));
    }

    #[test]
    fn test_cancel_interrupts_sleep() {
        let (ctx, handle) = Context::with_cancel();
        let sleeper = std::thread::spawn(move || ctx.sleep(Duration::from_secs(30)));

        std::thread::sleep(Duration::from_millis(20));
        handle.cancel();

        let result = sleeper.join().unwrap();
        assert!(matches!(result, Err(MigrationError::Cancelled)));
    }

    #[test]
    fn test_deadline_exceeded() {
        let ctx = Context::background().with_timeout(Duration::from_millis(10));
        let started = Instant::now();
        let result = ctx.sleep(Duration::from_secs(30));

        assert!(matches!(result, Err(MigrationError::DeadlineExceeded)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(ctx.err(), Some(MigrationError::DeadlineExceeded)));
    }

    #[test]
    fn test_with_deadline_keeps_earliest() {
        let soon = Instant::now() + Duration::from_secs(1);
        let later = soon + Duration::from_secs(60);
        let ctx = Context::background().with_deadline(soon).with_deadline(later);
        assert_eq!(ctx.deadline(), Some(soon));
    }
}
