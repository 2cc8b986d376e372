//! Worker-local execution context.
//!
//! Every worker thread has at most one current transaction and one current
//! owner. Both are only ever changed through scoped bindings that put the
//! previous value back when dropped, so the context is restored on every exit
//! path, unwinding included.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::errors::{Result, ThothError};
use crate::owner::TaskOwner;
use crate::transaction::Transaction;

#[derive(Default)]
struct WorkerContext {
    transaction: Option<Arc<Transaction>>,
    owner: Option<TaskOwner>,
    scheduler_thread: bool,
}

thread_local! {
    static CONTEXT: RefCell<WorkerContext> = RefCell::new(WorkerContext::default());
}

/// The transaction bound to the calling worker.
///
/// Fails with [`ThothError::NoActiveTransaction`] when no transaction is
/// bound, and with the transaction's own error when it is bound but can no
/// longer run task code.
pub fn current_transaction() -> Result<Arc<Transaction>> {
    let txn = CONTEXT
        .with(|ctx| ctx.borrow().transaction.clone())
        .ok_or(ThothError::NoActiveTransaction)?;
    txn.check_active()?;
    Ok(txn)
}

/// The owner the calling worker is currently running as.
pub fn current_owner() -> Option<TaskOwner> {
    CONTEXT.with(|ctx| ctx.borrow().owner.clone())
}

pub(crate) fn is_scheduler_thread() -> bool {
    CONTEXT.with(|ctx| ctx.borrow().scheduler_thread)
}

/// Restores the previous transaction binding when dropped.
pub(crate) struct TransactionBinding {
    previous: Option<Arc<Transaction>>,
    // Bindings belong to the thread that created them.
    _not_send: PhantomData<*const ()>,
}

pub(crate) fn bind_transaction(txn: Arc<Transaction>) -> TransactionBinding {
    let previous = CONTEXT.with(|ctx| ctx.borrow_mut().transaction.replace(txn));
    TransactionBinding {
        previous,
        _not_send: PhantomData,
    }
}

impl Drop for TransactionBinding {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CONTEXT.with(|ctx| ctx.borrow_mut().transaction = previous);
    }
}

/// Restores the previous owner when dropped.
pub(crate) struct OwnerBinding {
    previous: Option<TaskOwner>,
    _not_send: PhantomData<*const ()>,
}

pub(crate) fn bind_owner(owner: TaskOwner) -> OwnerBinding {
    let previous = CONTEXT.with(|ctx| ctx.borrow_mut().owner.replace(owner));
    OwnerBinding {
        previous,
        _not_send: PhantomData,
    }
}

impl Drop for OwnerBinding {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CONTEXT.with(|ctx| ctx.borrow_mut().owner = previous);
    }
}

pub(crate) struct SchedulerThreadBinding {
    previous: bool,
    _not_send: PhantomData<*const ()>,
}

pub(crate) fn mark_scheduler_thread() -> SchedulerThreadBinding {
    let previous = CONTEXT.with(|ctx| std::mem::replace(&mut ctx.borrow_mut().scheduler_thread, true));
    SchedulerThreadBinding {
        previous,
        _not_send: PhantomData,
    }
}

impl Drop for SchedulerThreadBinding {
    fn drop(&mut self) {
        let previous = self.previous;
        CONTEXT.with(|ctx| ctx.borrow_mut().scheduler_thread = previous);
    }
}
