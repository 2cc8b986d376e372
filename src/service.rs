//! Durable and non-durable task scheduling with retry.
//!
//! Every task submitted here runs inside a transaction. Failures that should
//! be retried are run again according to the configured [`RetryConfig`];
//! everything else is reported to the owner's [`AppContext`].
//!
//! Tasks scheduled while a transaction is bound to the calling thread only
//! take effect if that transaction commits. The scheduler slot is reserved
//! immediately, so a rejection is still reported to the caller.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use ahash::AHashMap as HashMap;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::config::RetryConfig;
use crate::context;
use crate::errors::{Result, Retry, ThothError};
use crate::handler::TaskHandler;
use crate::owner::{AppContext, Identity, TaskFailure, TaskOwner};
use crate::priority::Priority;
use crate::scheduler::recurring::RecurringTaskHandle;
use crate::scheduler::task::{AttemptFailure, RetryDecision, ScheduledTask};
use crate::scheduler::{KernelRunnable, RetryPolicy, TaskReservation, TaskScheduler};
use crate::store::{PendingTask, TaskStore, TaskStoreMutation};
use crate::transaction::Transaction;
use crate::twopc::{TransactionParticipant, Vote};

/// A task whose record survives restarts.
///
/// On recovery the task is rebuilt from its [`payload`](Self::payload) by the
/// factory registered for its [`task_type`](Self::task_type).
pub trait DurableTask: Send + Sync {
    fn task_type(&self) -> &str;

    fn payload(&self) -> String {
        String::new()
    }

    fn run(&self) -> Result<()>;
}

/// Rebuilds a durable task from its payload.
pub type TaskFactory = Arc<dyn Fn(&str) -> Result<Arc<dyn DurableTask>> + Send + Sync>;

struct ServiceRetryPolicy {
    retry: RetryConfig,
    startup: bool,
    // Record to drop when a one-shot durable task is given up on.
    record: Option<(Arc<dyn TaskStore>, u64)>,
}

impl ServiceRetryPolicy {
    fn give_up(&self, failure: &AttemptFailure<'_>, error: ThothError) {
        let context = failure.owner.context();
        context.notify_failure(&TaskFailure {
            task_type: failure.task_type.to_string(),
            identity: failure.owner.identity().clone(),
            error: error.clone(),
            attempts: failure.attempt,
        });
        if self.startup {
            context.halt(error);
        }
        if let Some((store, id)) = &self.record {
            if let Err(e) = store.apply_mutations(vec![TaskStoreMutation::Remove(*id)]) {
                warn!("Failed to drop pending task {}: {}", id, e);
            }
        }
    }
}

impl RetryPolicy for ServiceRetryPolicy {
    fn on_failure(&self, failure: &AttemptFailure<'_>) -> RetryDecision {
        if !failure.error.should_retry() {
            self.give_up(failure, failure.error.clone());
            return RetryDecision::GiveUp;
        }
        if self.retry.exhausted(failure.attempt) {
            self.give_up(
                failure,
                ThothError::RetryLimitExceeded {
                    attempts: failure.attempt,
                    last: Arc::new(failure.error.clone()),
                },
            );
            return RetryDecision::GiveUp;
        }
        debug!(
            "Retrying {} after attempt {}: {}",
            failure.task_type, failure.attempt, failure.error
        );
        RetryDecision::Retry {
            priority: self.retry.retry_priority.apply(failure.priority),
            delay: self.retry.delay_before(failure.attempt + 1),
        }
    }
}

/// Removes a durable task's record as part of its attempt.
///
/// The record is removed while preparing so a store failure fails the
/// attempt instead of surfacing after the commit point. An abort puts the
/// record back.
struct PendingTaskRemoval {
    name: String,
    store: Arc<dyn TaskStore>,
    record: PendingTask,
    removed: Mutex<bool>,
}

impl TransactionParticipant for PendingTaskRemoval {
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare(&self, _txn: &Transaction) -> Result<Vote> {
        let mut removed = self.removed.lock();
        self.store
            .apply_mutations(vec![TaskStoreMutation::Remove(self.record.id)])
            .map_err(|e| store_failure(&self.name, e))?;
        *removed = true;
        Ok(Vote::Prepared)
    }

    fn commit(&self, _txn: &Transaction) -> Result<()> {
        *self.removed.lock() = false;
        Ok(())
    }

    fn abort(&self, _txn: &Transaction) -> Result<()> {
        let mut removed = self.removed.lock();
        if !*removed {
            return Ok(());
        }
        self.store
            .apply_mutations(vec![TaskStoreMutation::Insert(self.record.clone())])
            .map_err(|e| store_failure(&self.name, e))?;
        *removed = false;
        Ok(())
    }
}

/// Persists and queues a task once the scheduling transaction commits.
///
/// The record is written while preparing and dropped again on abort. Only
/// the queueing itself happens after the commit point, and the reserved
/// slot can then only be refused by a scheduler shutdown.
struct DeferredSchedule {
    name: String,
    store: Arc<dyn TaskStore>,
    record: Option<PendingTask>,
    inserted: Mutex<bool>,
    reservation: Mutex<Option<TaskReservation>>,
}

impl DeferredSchedule {
    fn drop_record(&self) -> Result<()> {
        let mut inserted = self.inserted.lock();
        let Some(record) = self.record.as_ref().filter(|_| *inserted) else {
            return Ok(());
        };
        self.store
            .apply_mutations(vec![TaskStoreMutation::Remove(record.id)])
            .map_err(|e| store_failure(&self.name, e))?;
        *inserted = false;
        Ok(())
    }
}

impl TransactionParticipant for DeferredSchedule {
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare(&self, _txn: &Transaction) -> Result<Vote> {
        if let Some(record) = &self.record {
            let mut inserted = self.inserted.lock();
            self.store
                .apply_mutations(vec![TaskStoreMutation::Insert(record.clone())])
                .map_err(|e| store_failure(&self.name, e))?;
            *inserted = true;
        }
        Ok(Vote::Prepared)
    }

    fn commit(&self, _txn: &Transaction) -> Result<()> {
        let Some(reservation) = self.reservation.lock().take() else {
            return Ok(());
        };
        if let Err(e) = reservation.use_reservation() {
            if let Err(drop_err) = self.drop_record() {
                warn!("{}: failed to drop unqueued record: {}", self.name, drop_err);
            }
            return Err(e);
        }
        *self.inserted.lock() = false;
        Ok(())
    }

    fn abort(&self, _txn: &Transaction) -> Result<()> {
        if let Some(reservation) = self.reservation.lock().take() {
            reservation.cancel();
        }
        self.drop_record()
    }
}

fn store_failure(participant: &str, error: ThothError) -> ThothError {
    ThothError::Participant {
        participant: participant.to_string(),
        message: error.to_string(),
        retry: Retry::Retryable,
    }
}

enum RunnerBody {
    Plain(Arc<dyn KernelRunnable>),
    Durable {
        task: Arc<dyn DurableTask>,
        removal: Option<Arc<PendingTaskRemoval>>,
    },
}

/// Runs a task body inside a transaction through the task handler.
struct TransactionalRunner {
    task_type: String,
    handler: Arc<TaskHandler>,
    body: RunnerBody,
}

impl KernelRunnable for TransactionalRunner {
    fn base_task_type(&self) -> &str {
        &self.task_type
    }

    fn run(&self) -> Result<()> {
        self.handler.run_transactional_task(|| match &self.body {
            RunnerBody::Plain(task) => task.run(),
            RunnerBody::Durable { task, removal } => {
                if let Some(removal) = removal {
                    let txn = context::current_transaction()?;
                    txn.join(Arc::clone(removal) as Arc<dyn TransactionParticipant>)?;
                }
                task.run()
            }
        })
    }

    fn is_transactional(&self) -> bool {
        true
    }
}

struct PeriodicRegistry {
    store: Arc<dyn TaskStore>,
    handles: Mutex<HashMap<u64, Arc<RecurringTaskHandle>>>,
}

impl PeriodicRegistry {
    fn cancel(&self, id: u64) -> Result<()> {
        let Some(handle) = self.handles.lock().remove(&id) else {
            return Ok(());
        };
        handle.cancel();
        self.store
            .apply_mutations(vec![TaskStoreMutation::Remove(id)])
    }
}

/// Controls a durable periodic task.
#[derive(Clone)]
pub struct PeriodicTaskHandle {
    id: u64,
    registry: Arc<PeriodicRegistry>,
}

impl PeriodicTaskHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stops future firings and drops the task's record. Idempotent.
    pub fn cancel(&self) -> Result<()> {
        self.registry.cancel(self.id)
    }
}

/// Where a durable submission's record comes from.
enum Submission {
    /// The record still has to be written.
    New,
    /// The record is already in the store.
    Recovered,
}

/// Schedules application tasks above the [`TaskScheduler`].
pub struct TaskService {
    scheduler: Arc<TaskScheduler>,
    handler: Arc<TaskHandler>,
    store: Arc<dyn TaskStore>,
    context: Arc<AppContext>,
    retry: RetryConfig,
    factories: RwLock<HashMap<String, TaskFactory>>,
    periodic: Arc<PeriodicRegistry>,
    next_id: AtomicU64,
    recovered: AtomicBool,
}

impl TaskService {
    /// Creates the service for one application context.
    ///
    /// Durable records already in `store` are left alone until
    /// [`recover`](Self::recover) is called.
    pub fn new(
        scheduler: Arc<TaskScheduler>,
        handler: Arc<TaskHandler>,
        store: Arc<dyn TaskStore>,
        context: Arc<AppContext>,
        retry: RetryConfig,
    ) -> Result<Self> {
        let next_id = store
            .pending()?
            .iter()
            .map(|task| task.id + 1)
            .max()
            .unwrap_or(1);
        Ok(Self {
            scheduler,
            handler,
            periodic: Arc::new(PeriodicRegistry {
                store: Arc::clone(&store),
                handles: Mutex::new(HashMap::new()),
            }),
            store,
            context,
            retry,
            factories: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(next_id),
            recovered: AtomicBool::new(false),
        })
    }

    pub fn context(&self) -> &Arc<AppContext> {
        &self.context
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    /// Registers the factory that rebuilds durable tasks of `task_type`.
    pub fn register_task_type(&self, task_type: impl Into<String>, factory: TaskFactory) {
        self.factories.write().insert(task_type.into(), factory);
    }

    /// Schedules a durable task to run as soon as possible.
    ///
    /// Returns the id of the task's pending record.
    pub fn schedule_task(&self, task: Arc<dyn DurableTask>, owner: &TaskOwner) -> Result<u64> {
        self.schedule_durable(task, owner, Priority::default(), Duration::ZERO)
    }

    pub fn schedule_task_with_priority(
        &self,
        task: Arc<dyn DurableTask>,
        owner: &TaskOwner,
        priority: Priority,
    ) -> Result<u64> {
        self.schedule_durable(task, owner, priority, Duration::ZERO)
    }

    pub fn schedule_delayed_task(
        &self,
        task: Arc<dyn DurableTask>,
        owner: &TaskOwner,
        delay: Duration,
    ) -> Result<u64> {
        self.schedule_durable(task, owner, Priority::default(), delay)
    }

    /// Schedules a durable task that runs after `delay` and then every
    /// `period` until cancelled.
    ///
    /// Unlike one-shot tasks, periodic tasks start right away even when a
    /// transaction is bound to the caller.
    pub fn schedule_periodic_task(
        &self,
        task: Arc<dyn DurableTask>,
        owner: &TaskOwner,
        delay: Duration,
        period: Duration,
    ) -> Result<PeriodicTaskHandle> {
        self.check_accepting(owner)?;
        self.check_durable(task.as_ref(), owner)?;
        let record = self.record(task.as_ref(), owner, Priority::default(), delay, Some(period));
        let id = record.id;
        self.store
            .apply_mutations(vec![TaskStoreMutation::Insert(record)])?;
        if let Err(e) = self.start_periodic(id, task, owner.clone(), delay, period) {
            if let Err(remove_err) = self.store.apply_mutations(vec![TaskStoreMutation::Remove(id)]) {
                warn!("Failed to drop pending task {}: {}", id, remove_err);
            }
            return Err(e);
        }
        Ok(PeriodicTaskHandle {
            id,
            registry: Arc::clone(&self.periodic),
        })
    }

    /// The handle of a running periodic task, including recovered ones.
    pub fn periodic_task(&self, id: u64) -> Option<PeriodicTaskHandle> {
        self.periodic
            .handles
            .lock()
            .contains_key(&id)
            .then(|| PeriodicTaskHandle {
                id,
                registry: Arc::clone(&self.periodic),
            })
    }

    /// Schedules a task that is not persisted and may be lost on restart.
    pub fn schedule_non_durable_task(
        &self,
        task: Arc<dyn KernelRunnable>,
        owner: &TaskOwner,
    ) -> Result<()> {
        self.schedule_plain(task, owner, Priority::default(), Duration::ZERO, false)
    }

    pub fn schedule_non_durable_task_with_priority(
        &self,
        task: Arc<dyn KernelRunnable>,
        owner: &TaskOwner,
        priority: Priority,
    ) -> Result<()> {
        self.schedule_plain(task, owner, priority, Duration::ZERO, false)
    }

    pub fn schedule_delayed_non_durable_task(
        &self,
        task: Arc<dyn KernelRunnable>,
        owner: &TaskOwner,
        delay: Duration,
    ) -> Result<()> {
        self.schedule_plain(task, owner, Priority::default(), delay, false)
    }

    /// Schedules a task the application cannot start without.
    ///
    /// If the task fails for good, the owner's context is halted and
    /// accepts no further tasks.
    pub fn schedule_startup_task(
        &self,
        task: Arc<dyn KernelRunnable>,
        owner: &TaskOwner,
    ) -> Result<()> {
        self.schedule_plain(task, owner, Priority::High, Duration::ZERO, true)
    }

    /// Runs `task` transactionally on the calling thread, retrying it
    /// according to the retry configuration.
    pub fn run_transactional_task(
        &self,
        task: Arc<dyn KernelRunnable>,
        owner: &TaskOwner,
    ) -> Result<()> {
        self.check_accepting(owner)?;
        let runner: Arc<dyn KernelRunnable> = Arc::new(self.runner(
            task.base_task_type().to_string(),
            RunnerBody::Plain(task),
        ));
        let mut attempt = 1;
        loop {
            match self.scheduler.run_task(Arc::clone(&runner), owner.clone()) {
                Ok(()) => return Ok(()),
                Err(e) if e.should_retry() => {
                    if self.retry.exhausted(attempt) {
                        return Err(ThothError::RetryLimitExceeded {
                            attempts: attempt,
                            last: Arc::new(e),
                        });
                    }
                    attempt += 1;
                    debug!(
                        "Retrying {} (attempt {}): {}",
                        runner.base_task_type(),
                        attempt,
                        e
                    );
                    let delay = self.retry.delay_before(attempt);
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Reschedules every persisted task. Returns how many were scheduled.
    ///
    /// Records whose task type has no registered factory are skipped and
    /// left in the store. May only be called once.
    pub fn recover(&self) -> Result<usize> {
        if self.recovered.swap(true, Ordering::AcqRel) {
            return Err(ThothError::InvalidState(
                "pending tasks were already recovered".to_string(),
            ));
        }
        let now = self.now_millis();
        let mut scheduled = 0;
        for record in self.store.pending()? {
            let factory = self.factories.read().get(&record.task_type).cloned();
            let Some(factory) = factory else {
                warn!(
                    "No factory for task type {}, leaving task {} pending",
                    record.task_type, record.id
                );
                continue;
            };
            let task = match factory(&record.payload) {
                Ok(task) => task,
                Err(e) => {
                    warn!("Failed to rebuild task {}: {}", record.id, e);
                    continue;
                }
            };
            let owner = TaskOwner::new(Identity::new(&record.identity), Arc::clone(&self.context));
            let id = record.id;
            let delay = Duration::from_millis(record.start_time.saturating_sub(now));
            let outcome = match record.period_millis.map(Duration::from_millis) {
                Some(period) => self.start_periodic(id, task, owner, delay, period),
                None => self.submit_durable(record, task, &owner, delay, Submission::Recovered),
            };
            match outcome {
                Ok(()) => scheduled += 1,
                Err(e) => warn!("Failed to reschedule task {}: {}", id, e),
            }
        }
        info!("Recovered {} pending task(s)", scheduled);
        Ok(scheduled)
    }

    fn schedule_durable(
        &self,
        task: Arc<dyn DurableTask>,
        owner: &TaskOwner,
        priority: Priority,
        delay: Duration,
    ) -> Result<u64> {
        self.check_accepting(owner)?;
        self.check_durable(task.as_ref(), owner)?;
        let record = self.record(task.as_ref(), owner, priority, delay, None);
        let id = record.id;
        self.submit_durable(record, task, owner, delay, Submission::New)?;
        Ok(id)
    }

    fn submit_durable(
        &self,
        record: PendingTask,
        task: Arc<dyn DurableTask>,
        owner: &TaskOwner,
        delay: Duration,
        submission: Submission,
    ) -> Result<()> {
        let id = record.id;
        let priority = record.priority;
        let removal = Arc::new(PendingTaskRemoval {
            name: format!("pending-task-{}", id),
            store: Arc::clone(&self.store),
            record: record.clone(),
            removed: Mutex::new(false),
        });
        let runner = self.runner(
            task.task_type().to_string(),
            RunnerBody::Durable {
                task,
                removal: Some(removal),
            },
        );
        let policy = ServiceRetryPolicy {
            retry: self.retry.clone(),
            startup: false,
            record: Some((Arc::clone(&self.store), id)),
        };
        let scheduled = ScheduledTask::new(Arc::new(runner), owner.clone(), priority)
            .with_retry(Some(Arc::new(policy)));
        match submission {
            Submission::New => self.submit(scheduled, delay, Some(record)),
            Submission::Recovered => self.scheduler.submit(scheduled, due(delay)),
        }
    }

    fn schedule_plain(
        &self,
        task: Arc<dyn KernelRunnable>,
        owner: &TaskOwner,
        priority: Priority,
        delay: Duration,
        startup: bool,
    ) -> Result<()> {
        self.check_accepting(owner)?;
        let runner = self.runner(task.base_task_type().to_string(), RunnerBody::Plain(task));
        let policy = ServiceRetryPolicy {
            retry: self.retry.clone(),
            startup,
            record: None,
        };
        let scheduled = ScheduledTask::new(Arc::new(runner), owner.clone(), priority)
            .with_retry(Some(Arc::new(policy)));
        self.submit(scheduled, delay, None)
    }

    /// Queues now, or on commit when a transaction is bound to the caller.
    fn submit(&self, task: ScheduledTask, delay: Duration, record: Option<PendingTask>) -> Result<()> {
        let txn = match context::current_transaction() {
            Ok(txn) => Some(txn),
            Err(ThothError::NoActiveTransaction) => None,
            Err(e) => return Err(e),
        };
        let name = format!("schedule-{}", task.runnable.base_task_type());
        let reservation = self.scheduler.reserve(task, due(delay))?;

        match txn {
            Some(txn) => txn.join(Arc::new(DeferredSchedule {
                name,
                store: Arc::clone(&self.store),
                record,
                inserted: Mutex::new(false),
                reservation: Mutex::new(Some(reservation)),
            })),
            None => {
                let id = record.as_ref().map(|r| r.id);
                if let Some(record) = record {
                    self.store
                        .apply_mutations(vec![TaskStoreMutation::Insert(record)])?;
                }
                let queued = reservation.use_reservation();
                if let (Err(_), Some(id)) = (&queued, id) {
                    if let Err(e) = self.store.apply_mutations(vec![TaskStoreMutation::Remove(id)]) {
                        warn!("Failed to drop pending task {}: {}", id, e);
                    }
                }
                queued
            }
        }
    }

    fn start_periodic(
        &self,
        id: u64,
        task: Arc<dyn DurableTask>,
        owner: TaskOwner,
        delay: Duration,
        period: Duration,
    ) -> Result<()> {
        let runner = self.runner(
            task.task_type().to_string(),
            RunnerBody::Durable {
                task,
                removal: None,
            },
        );
        let policy = ServiceRetryPolicy {
            retry: self.retry.clone(),
            startup: false,
            record: None,
        };
        let scheduled = ScheduledTask::new(Arc::new(runner), owner, Priority::default())
            .with_retry(Some(Arc::new(policy)));
        let handle = Arc::new(self.scheduler.submit_recurring(
            scheduled,
            Instant::now() + delay,
            period,
        )?);
        handle.start()?;
        self.periodic.handles.lock().insert(id, handle);
        Ok(())
    }

    fn runner(&self, task_type: String, body: RunnerBody) -> TransactionalRunner {
        TransactionalRunner {
            task_type,
            handler: Arc::clone(&self.handler),
            body,
        }
    }

    fn record(
        &self,
        task: &dyn DurableTask,
        owner: &TaskOwner,
        priority: Priority,
        delay: Duration,
        period: Option<Duration>,
    ) -> PendingTask {
        PendingTask {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            task_type: task.task_type().to_string(),
            payload: task.payload(),
            identity: owner.identity().name().to_string(),
            priority,
            start_time: self.now_millis() + delay.as_millis() as u64,
            period_millis: period.map(|p| p.as_millis() as u64),
        }
    }

    fn check_accepting(&self, owner: &TaskOwner) -> Result<()> {
        if owner.context().is_halted() {
            return Err(ThothError::TaskRejected(format!(
                "application context {} is halted",
                owner.context().name()
            )));
        }
        Ok(())
    }

    fn check_durable(&self, task: &dyn DurableTask, owner: &TaskOwner) -> Result<()> {
        if !Arc::ptr_eq(owner.context(), &self.context) {
            return Err(ThothError::InvalidState(format!(
                "durable task {} owned by another application context",
                task.task_type()
            )));
        }
        if !self.factories.read().contains_key(task.task_type()) {
            return Err(ThothError::InvalidState(format!(
                "no factory registered for durable task type {}",
                task.task_type()
            )));
        }
        Ok(())
    }

    fn now_millis(&self) -> u64 {
        self.handler.coordinator().clock().now_millis()
    }
}

fn due(delay: Duration) -> Option<Instant> {
    (!delay.is_zero()).then(|| Instant::now() + delay)
}
