use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, warn};

use crate::access::AccessCoordinator;
use crate::conflict::resolution::ConflictMode;
use crate::errors::{Result, ThothError};
use crate::transaction::{Transaction, TransactionId, TransactionState};

/// Source of transaction creation times, in milliseconds.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// Wall-clock time since the Unix epoch.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub fn new(start: u64) -> Self {
        ManualClock(AtomicU64::new(start))
    }

    pub fn set(&self, millis: u64) {
        self.0.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: u64) {
        self.0.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Creates transactions and starts conflict tracking for them.
pub struct TransactionCoordinator {
    counter: AtomicU64,
    clock: Arc<dyn Clock>,
    access: Arc<AccessCoordinator>,
    handler_bound: AtomicBool,
}

impl TransactionCoordinator {
    pub fn new(access: Arc<AccessCoordinator>) -> Self {
        Self::with_clock(access, Arc::new(SystemClock))
    }

    pub fn with_clock(access: Arc<AccessCoordinator>, clock: Arc<dyn Clock>) -> Self {
        Self {
            counter: AtomicU64::new(1),
            clock,
            access,
            handler_bound: AtomicBool::new(false),
        }
    }

    /// A coordinator with its own access coordinator in `mode`.
    pub fn standalone(mode: ConflictMode) -> Self {
        Self::new(Arc::new(AccessCoordinator::new(mode)))
    }

    pub fn access_coordinator(&self) -> &Arc<AccessCoordinator> {
        &self.access
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Creates a new active transaction, tracked by the conflict checker.
    pub fn create_transaction(&self) -> Result<TransactionHandle> {
        let id = TransactionId::from_counter(self.counter.fetch_add(1, Ordering::SeqCst));
        let txn = Arc::new(Transaction::new(id, self.clock.now_millis()));
        self.access.started(&txn)?;
        Ok(TransactionHandle { txn })
    }

    /// Claims the coordinator for a task handler. Only one may be bound.
    pub(crate) fn bind_handler(&self) -> Result<()> {
        if self.handler_bound.swap(true, Ordering::AcqRel) {
            return Err(ThothError::InvalidState(
                "a task handler is already bound to this coordinator".to_string(),
            ));
        }
        Ok(())
    }
}

/// Commit and abort access to one transaction.
///
/// A handle dropped while its transaction is still active aborts it.
pub struct TransactionHandle {
    txn: Arc<Transaction>,
}

impl TransactionHandle {
    pub fn transaction(&self) -> &Arc<Transaction> {
        &self.txn
    }

    /// Prepares and commits. On failure the transaction is aborted with the
    /// failure as its cause and the failure is returned.
    pub fn commit(&self) -> Result<()> {
        match self.txn.commit() {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Err(abort_err) = self.txn.abort(e.clone()) {
                    debug!(
                        "Transaction {} was already finished after a failed commit: {}",
                        self.txn.id(),
                        abort_err
                    );
                }
                Err(e)
            }
        }
    }

    pub fn abort(&self, cause: ThothError) -> Result<()> {
        self.txn.abort(cause)
    }
}

impl Drop for TransactionHandle {
    fn drop(&mut self) {
        if matches!(
            self.txn.state(),
            TransactionState::Active | TransactionState::Preparing
        ) {
            warn!("Transaction {} dropped unfinished, aborting", self.txn.id());
            let _ = self.txn.abort(ThothError::InvalidState(
                "transaction handle dropped before commit".to_string(),
            ));
        }
    }
}
