//! Request-scoped context.
//!
//! A [`Context`] carries the deadline and cancellation flag of one request and
//! the slot holding that request's transaction. Clones share all three, so any
//! write issued through any clone while a transaction is open joins it.
//! Background work that must not join the request's transaction starts from
//! [`Context::background`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Result, StoreError};
use crate::transaction::Transaction;

struct Shared {
    deadline: Option<Instant>,
    cancelled: AtomicBool,
    tx: Mutex<Option<Arc<Transaction>>>,
}

#[derive(Clone)]
pub struct Context {
    inner: Arc<Shared>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("deadline", &self.inner.deadline)
            .field("cancelled", &self.is_cancelled())
            .field("in_transaction", &self.transaction().is_some())
            .finish()
    }
}

impl Context {
    fn with_deadline(deadline: Option<Instant>) -> Self {
        Self {
            inner: Arc::new(Shared {
                deadline,
                cancelled: AtomicBool::new(false),
                tx: Mutex::new(None),
            }),
        }
    }

    /// Context with no deadline, for workers and tests.
    pub fn background() -> Self {
        Self::with_deadline(None)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Some(Instant::now() + timeout))
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Fail fast when the request is cancelled or past its deadline.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        if let Some(deadline) = self.inner.deadline {
            if Instant::now() >= deadline {
                return Err(StoreError::DeadlineExceeded);
            }
        }
        Ok(())
    }

    /// The open transaction, if any.
    pub fn transaction(&self) -> Option<Arc<Transaction>> {
        self.slot().clone()
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction().is_some()
    }

    pub(crate) fn install(&self, tx: Arc<Transaction>) {
        *self.slot() = Some(tx);
    }

    pub(crate) fn take_transaction(&self) -> Option<Arc<Transaction>> {
        self.slot().take()
    }

    /// Request-end hook: discard a transaction that was opened and never
    /// committed. Returns `true` when one was rolled back.
    pub fn rollback_pending(&self) -> bool {
        match self.take_transaction() {
            Some(tx) if tx.is_pending() => {
                tracing::warn!(writes = tx.len(), "rolling back uncommitted request transaction");
                tx.discard();
                true
            }
            _ => false,
        }
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<Arc<Transaction>>> {
        self.inner.tx.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_shared_by_clones() {
        let ctx = Context::background();
        let clone = ctx.clone();
        assert!(clone.check().is_ok());
        ctx.cancel();
        assert!(matches!(clone.check(), Err(StoreError::Cancelled)));
    }

    #[test]
    fn test_deadline() {
        let ctx = Context::with_timeout(Duration::from_millis(0));
        assert!(matches!(ctx.check(), Err(StoreError::DeadlineExceeded)));
    }

    #[test]
    fn test_rollback_pending() {
        let ctx = Context::background();
        assert!(!ctx.rollback_pending());
        let tx = Arc::new(Transaction::new());
        ctx.install(tx.clone());
        assert!(ctx.clone().in_transaction());
        assert!(ctx.rollback_pending());
        assert!(!tx.is_pending());
        assert!(!ctx.in_transaction());
    }
}
