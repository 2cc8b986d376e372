use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, ThothError};
use crate::priority::Priority;

/// A durable task that has been accepted but has not yet run to commit.
///
/// Periodic tasks keep their record until they are cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTask {
    pub id: u64,
    /// The registered task type used to rebuild the task on recovery.
    pub task_type: String,
    /// Task-defined state handed back to the task factory.
    pub payload: String,
    /// Name of the identity the task runs as.
    pub identity: String,
    pub priority: Priority,
    /// Wall-clock time in milliseconds at which the task may first run.
    pub start_time: u64,
    pub period_millis: Option<u64>,
}

impl PendingTask {
    pub fn is_periodic(&self) -> bool {
        self.period_millis.is_some()
    }
}

/// A single change to the pending-task store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStoreMutation {
    /// Insert or replace the record with the same id.
    Insert(PendingTask),
    /// Remove the record with this id. Removing a missing record is a no-op.
    Remove(u64),
}

/// Persistence for durable task records.
///
/// Implementations must apply each batch of mutations atomically: either
/// every mutation in one [`apply_mutations`](TaskStore::apply_mutations) call
/// is persisted, or none is. Implementations must be `Send` and `Sync`
/// because tasks finish on any worker thread.
pub trait TaskStore: Send + Sync {
    fn apply_mutations(&self, mutations: Vec<TaskStoreMutation>) -> Result<()>;

    /// Every record currently persisted, in id order.
    fn pending(&self) -> Result<Vec<PendingTask>>;
}

/// A [`TaskStore`] that keeps records in memory.
///
/// Records survive for as long as the store value does, so sharing one store
/// between two services simulates a restart.
#[derive(Default)]
pub struct MemoryTaskStore {
    records: Mutex<BTreeMap<u64, PendingTask>>,
    failures: Mutex<u32>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` calls to `apply_mutations` fail.
    pub fn fail_next(&self, count: u32) {
        *self.failures.lock() = count;
    }

    pub fn get(&self, id: u64) -> Option<PendingTask> {
        self.records.lock().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl TaskStore for MemoryTaskStore {
    fn apply_mutations(&self, mutations: Vec<TaskStoreMutation>) -> Result<()> {
        {
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(ThothError::TaskStore("injected store failure".to_string()));
            }
        }
        let mut records = self.records.lock();
        for mutation in mutations {
            match mutation {
                TaskStoreMutation::Insert(task) => {
                    records.insert(task.id, task);
                }
                TaskStoreMutation::Remove(id) => {
                    records.remove(&id);
                }
            }
        }
        Ok(())
    }

    fn pending(&self) -> Result<Vec<PendingTask>> {
        Ok(self.records.lock().values().cloned().collect())
    }
}
