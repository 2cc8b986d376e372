use std::sync::Arc;

use log::{trace, warn};

use crate::context;
use crate::coordinator::TransactionCoordinator;
use crate::errors::{Result, ThothError};
use crate::owner::TaskOwner;

/// Runs task bodies inside transactions.
///
/// A coordinator accepts exactly one handler; creating a second handler for
/// the same coordinator fails.
pub struct TaskHandler {
    coordinator: Arc<TransactionCoordinator>,
}

impl TaskHandler {
    pub fn new(coordinator: Arc<TransactionCoordinator>) -> Result<Self> {
        coordinator.bind_handler()?;
        Ok(Self { coordinator })
    }

    pub fn coordinator(&self) -> &Arc<TransactionCoordinator> {
        &self.coordinator
    }

    /// Runs `body` as `owner`, restoring the previous owner afterwards.
    pub fn run_task_as_owner<R, F>(&self, owner: &TaskOwner, body: F) -> Result<R>
    where
        F: FnOnce() -> Result<R>,
    {
        let _owner = context::bind_owner(owner.clone());
        body()
    }

    /// Runs `body` inside a fresh transaction, then commits or aborts it.
    ///
    /// The transaction is bound as the worker's current transaction only while
    /// `body` runs. If `body` fails, the transaction is aborted with that
    /// failure as cause and the same failure is returned. A body that panics
    /// leaves the transaction aborted.
    pub fn run_transactional_task<R, F>(&self, body: F) -> Result<R>
    where
        F: FnOnce() -> Result<R>,
    {
        let handle = self.coordinator.create_transaction()?;
        let txn = Arc::clone(handle.transaction());
        trace!("Running task in transaction {}", txn.id());

        let outcome = {
            let _binding = context::bind_transaction(Arc::clone(&txn));
            body()
        };

        match outcome {
            Ok(value) => {
                handle.commit()?;
                Ok(value)
            }
            Err(e) => {
                match handle.abort(e.clone()) {
                    // Already aborted on its own, e.g. by a failed participant.
                    Ok(()) | Err(ThothError::TransactionNotActive(_)) => {}
                    Err(abort_err) => {
                        warn!("Failed to abort transaction {}: {}", txn.id(), abort_err)
                    }
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AccessType;
    use crate::conflict::resolution::ConflictMode;
    use crate::owner::{AppContext, Identity};
    use crate::transaction::TransactionState;
    use parking_lot::Mutex;

    fn handler() -> TaskHandler {
        let coordinator = Arc::new(TransactionCoordinator::standalone(ConflictMode::FailFast));
        TaskHandler::new(coordinator).unwrap()
    }

    #[test]
    fn second_handler_is_refused() {
        let coordinator = Arc::new(TransactionCoordinator::standalone(ConflictMode::FailFast));
        let _first = TaskHandler::new(Arc::clone(&coordinator)).unwrap();
        assert!(matches!(
            TaskHandler::new(coordinator),
            Err(ThothError::InvalidState(_))
        ));
    }

    #[test]
    fn successful_body_commits() {
        let handler = handler();
        let seen = Mutex::new(None);
        let value = handler
            .run_transactional_task(|| {
                *seen.lock() = Some(context::current_transaction()?);
                Ok(42)
            })
            .unwrap();

        assert_eq!(value, 42);
        let txn = seen.lock().take().unwrap();
        assert_eq!(txn.state(), TransactionState::Committed);
        assert!(matches!(
            context::current_transaction(),
            Err(ThothError::NoActiveTransaction)
        ));
    }

    #[test]
    fn failing_body_aborts_and_releases_its_accesses() {
        let handler = handler();
        let access = Arc::clone(handler.coordinator().access_coordinator());
        let reporter = access.register_access_source::<&'static str>("objects");
        let seen = Mutex::new(None);

        let err = handler
            .run_transactional_task(|| -> Result<()> {
                *seen.lock() = Some(context::current_transaction()?);
                reporter.report_access("a", AccessType::Write)?;
                reporter.report_access("b", AccessType::Read)?;
                Err(ThothError::fatal("body failed"))
            })
            .unwrap_err();

        assert_eq!(err.to_string(), "Task failed: body failed");
        let txn = seen.lock().take().unwrap();
        assert_eq!(txn.state(), TransactionState::Aborted);
        assert_eq!(
            txn.abort_cause().map(|c| c.to_string()),
            Some("Task failed: body failed".to_string())
        );
        assert_eq!(access.checker().tracked_objects(), 0);
        assert!(context::current_transaction().is_err());
    }

    #[test]
    fn owner_is_restored_after_failure() {
        let handler = handler();
        let ctx = AppContext::new("app");
        let owner = TaskOwner::new(Identity::new("alice"), ctx);

        let result: Result<()> = handler.run_task_as_owner(&owner, || {
            assert_eq!(context::current_owner().as_ref(), Some(&owner));
            Err(ThothError::fatal("nope"))
        });
        assert!(result.is_err());
        assert!(context::current_owner().is_none());
    }
}
