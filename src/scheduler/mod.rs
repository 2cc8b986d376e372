//! Priority scheduling of tasks onto a fixed pool of worker threads.

pub(crate) mod queue;
pub mod recurring;
pub mod task;

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use log::{debug, info, trace, warn};
use parking_lot::{Condvar, Mutex};

use crate::config::ThothConfig;
use crate::context;
use crate::errors::{Result, ThothError};
use crate::owner::TaskOwner;
use crate::priority::Priority;
use crate::profile::{ProfileCollector, ProfileListener, TaskReport};

use self::queue::{DelayQueue, ReadyQueue};
use self::recurring::{RecurringState, RecurringTaskHandle};
use self::task::{AttemptFailure, Recurrence, RetryDecision, ScheduledTask};

pub use self::task::{KernelRunnable, NamedTask, RetryPolicy, named, runnable};

/// How a submission is counted against the backlog bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    /// New work, rejected when the backlog is full.
    New,
    /// Work holding a reservation slot.
    Reserved,
    /// Retries and later firings of work already admitted.
    Internal,
}

struct State {
    ready: ReadyQueue<ScheduledTask>,
    delayed: DelayQueue<ScheduledTask>,
    reserved: usize,
    shutting_down: bool,
}

impl State {
    fn backlog(&self) -> usize {
        self.ready.len() + self.delayed.len() + self.reserved
    }
}

pub(crate) struct Shared {
    state: Mutex<State>,
    available: Condvar,
    max_backlog: Option<usize>,
    thread_count: usize,
    profile: ProfileCollector,
}

impl Shared {
    pub(crate) fn enqueue(
        &self,
        task: ScheduledTask,
        due: Option<Instant>,
        admission: Admission,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if admission == Admission::Reserved {
            state.reserved = state.reserved.saturating_sub(1);
        }
        if state.shutting_down {
            return Err(ThothError::TaskRejected(
                "scheduler is shutting down".to_string(),
            ));
        }
        if admission == Admission::New {
            self.admit(&state)?;
        }
        trace!(
            "Queueing {} (attempt {}) at {:?}",
            task.runnable.base_task_type(),
            task.attempt,
            task.priority
        );
        match due {
            Some(due) if due > Instant::now() => state.delayed.push(due, task),
            _ => {
                let priority = task.priority;
                state.ready.push(priority, task);
            }
        }
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    fn admit(&self, state: &State) -> Result<()> {
        match self.max_backlog {
            Some(max) if state.backlog() >= max => {
                warn!("Rejecting task, backlog of {} is full", max);
                Err(ThothError::TaskRejected(format!(
                    "backlog of {} tasks is full",
                    max
                )))
            }
            _ => Ok(()),
        }
    }

    fn reserve(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.shutting_down {
            return Err(ThothError::TaskRejected(
                "scheduler is shutting down".to_string(),
            ));
        }
        self.admit(&state)?;
        state.reserved += 1;
        Ok(())
    }

    fn release_reservation(&self) {
        let mut state = self.state.lock();
        state.reserved = state.reserved.saturating_sub(1);
    }

    fn next_task(&self) -> Option<(ScheduledTask, usize)> {
        let mut state = self.state.lock();
        loop {
            if state.shutting_down {
                return None;
            }
            let now = Instant::now();
            while let Some(task) = state.delayed.pop_due(now) {
                let priority = task.priority;
                state.ready.push(priority, task);
            }
            let depth = state.ready.len();
            if let Some(task) = state.ready.pop() {
                if !state.ready.is_empty() {
                    self.available.notify_one();
                }
                return Some((task, depth));
            }
            match state.delayed.next_due() {
                Some(due) => {
                    self.available.wait_until(&mut state, due);
                }
                None => self.available.wait(&mut state),
            }
        }
    }

    fn execute(&self, task: ScheduledTask, ready_count: usize) {
        if task.is_cancelled() {
            debug!(
                "Skipping cancelled recurring task {}",
                task.runnable.base_task_type()
            );
            return;
        }
        let result = self.run_attempt(&task, ready_count, run_guarded);

        if let Err(e) = &result {
            let decision = match &task.retry {
                Some(policy) => policy.on_failure(&AttemptFailure {
                    task_type: task.runnable.base_task_type(),
                    owner: &task.owner,
                    priority: task.priority,
                    attempt: task.attempt,
                    error: e,
                }),
                None => {
                    warn!(
                        "Task {} owned by {} failed: {}",
                        task.runnable.base_task_type(),
                        task.owner,
                        e
                    );
                    RetryDecision::GiveUp
                }
            };
            if let RetryDecision::Retry { priority, delay } = decision {
                if task.is_cancelled() {
                    return;
                }
                let due = (!delay.is_zero()).then(|| Instant::now() + delay);
                let task_type = task.runnable.base_task_type().to_string();
                if let Err(e) = self.enqueue(task.retried(priority), due, Admission::Internal) {
                    warn!("Dropping retry of {}: {}", task_type, e);
                }
                return;
            }
        }

        if let Some((due, next)) = task.next_firing(Instant::now()) {
            if next.is_cancelled() {
                return;
            }
            if let Err(e) = self.enqueue(next, Some(due), Admission::Internal) {
                debug!("Recurring task stopped: {}", e);
            }
        }
    }

    /// Runs one attempt as the task's owner and reports it.
    fn run_attempt(
        &self,
        task: &ScheduledTask,
        ready_count: usize,
        run: impl FnOnce(&dyn KernelRunnable) -> Result<()>,
    ) -> Result<()> {
        let started = Instant::now();
        let result = {
            let _owner = context::bind_owner(task.owner.clone());
            run(task.runnable.as_ref())
        };
        self.profile.report(&TaskReport {
            task_type: task.runnable.base_task_type().to_string(),
            owner: task.owner.clone(),
            attempt: task.attempt,
            transactional: task.runnable.is_transactional(),
            ready_count,
            thread_count: self.thread_count,
            duration: started.elapsed(),
            failure: result.as_ref().err().map(|e| e.to_string()),
        });
        result
    }
}

fn run_guarded(runnable: &dyn KernelRunnable) -> Result<()> {
    panic::catch_unwind(AssertUnwindSafe(|| runnable.run())).unwrap_or_else(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Err(ThothError::Panicked(message))
    })
}

// Tells shutdown a worker is gone, however it exits.
struct ExitNotice {
    index: usize,
    exits: Sender<usize>,
}

impl Drop for ExitNotice {
    fn drop(&mut self) {
        let _ = self.exits.send(self.index);
    }
}

fn spawn_worker(shared: Arc<Shared>, index: usize, exits: Sender<usize>) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("thoth-worker-{}", index))
        .spawn(move || {
            let _notice = ExitNotice { index, exits };
            let _scheduler_thread = context::mark_scheduler_thread();
            shared.profile.thread_started();
            while let Some((task, ready_count)) = shared.next_task() {
                shared.execute(task, ready_count);
            }
            shared.profile.thread_stopped();
            trace!("Worker {} exiting", index);
        })
        .map_err(|e| ThothError::InvalidState(format!("failed to spawn worker thread: {}", e)))
}

/// Runs tasks on a fixed pool of worker threads.
///
/// Ready tasks are dispatched by priority weight, in submission order within
/// a priority. Delayed and recurring tasks become ready at their start time.
/// Submissions are refused once shutdown has begun or when the configured
/// backlog bound is reached.
pub struct TaskScheduler {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    exits: Receiver<usize>,
    shutdown_timeout: Duration,
}

impl TaskScheduler {
    pub fn new(config: &ThothConfig) -> Result<Self> {
        Self::with_listeners(config, Vec::new())
    }

    /// Creates the scheduler with listeners registered before any worker starts.
    pub fn with_listeners(
        config: &ThothConfig,
        listeners: Vec<Arc<dyn ProfileListener>>,
    ) -> Result<Self> {
        config.validate()?;
        let profile = ProfileCollector::default();
        for listener in listeners {
            profile.add(listener);
        }
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                ready: ReadyQueue::new(),
                delayed: DelayQueue::new(),
                reserved: 0,
                shutting_down: false,
            }),
            available: Condvar::new(),
            max_backlog: config.max_backlog,
            thread_count: config.worker_threads,
            profile,
        });

        let (tx, exits) = crossbeam_channel::unbounded();
        let scheduler = Self {
            shared,
            workers: Mutex::new(Vec::with_capacity(config.worker_threads)),
            exits,
            shutdown_timeout: config.shutdown_timeout,
        };
        for index in 0..config.worker_threads {
            let handle = spawn_worker(Arc::clone(&scheduler.shared), index, tx.clone())?;
            scheduler.workers.lock().push(handle);
        }
        info!(
            "Task scheduler started with {} worker thread(s)",
            config.worker_threads
        );
        Ok(scheduler)
    }

    pub fn add_profile_listener(&self, listener: Arc<dyn ProfileListener>) {
        self.shared.profile.add(listener);
    }

    pub fn schedule_task(&self, task: Arc<dyn KernelRunnable>, owner: TaskOwner) -> Result<()> {
        self.schedule_task_with_priority(task, owner, Priority::default())
    }

    pub fn schedule_task_with_priority(
        &self,
        task: Arc<dyn KernelRunnable>,
        owner: TaskOwner,
        priority: Priority,
    ) -> Result<()> {
        self.submit(ScheduledTask::new(task, owner, priority), None)
    }

    /// Runs `task` once `delay` has passed.
    pub fn schedule_delayed_task(
        &self,
        task: Arc<dyn KernelRunnable>,
        owner: TaskOwner,
        delay: Duration,
    ) -> Result<()> {
        self.submit(
            ScheduledTask::new(task, owner, Priority::default()),
            Some(Instant::now() + delay),
        )
    }

    /// Creates a recurring task firing first at `start` and then every
    /// `period`. The task does not run until the handle is started.
    pub fn schedule_recurring_task(
        &self,
        task: Arc<dyn KernelRunnable>,
        owner: TaskOwner,
        start: Instant,
        period: Duration,
    ) -> Result<RecurringTaskHandle> {
        self.submit_recurring(ScheduledTask::new(task, owner, Priority::default()), start, period)
    }

    /// Reserves a backlog slot for `task` without queueing it yet.
    pub fn reserve_task(
        &self,
        task: Arc<dyn KernelRunnable>,
        owner: TaskOwner,
    ) -> Result<TaskReservation> {
        self.reserve_task_with_priority(task, owner, Priority::default())
    }

    pub fn reserve_task_with_priority(
        &self,
        task: Arc<dyn KernelRunnable>,
        owner: TaskOwner,
        priority: Priority,
    ) -> Result<TaskReservation> {
        self.reserve(ScheduledTask::new(task, owner, priority), None)
    }

    /// Runs `task` on the calling thread and returns its result.
    ///
    /// Not allowed from code that is itself running under this scheduler.
    pub fn run_task(&self, task: Arc<dyn KernelRunnable>, owner: TaskOwner) -> Result<()> {
        if context::is_scheduler_thread() {
            return Err(ThothError::InvalidState(
                "run_task cannot be called from a scheduler thread".to_string(),
            ));
        }
        if self.is_shutting_down() {
            return Err(ThothError::TaskRejected(
                "scheduler is shutting down".to_string(),
            ));
        }
        let _scheduler_thread = context::mark_scheduler_thread();
        let task = ScheduledTask::new(task, owner, Priority::default());
        self.shared
            .run_attempt(&task, self.ready_count(), |runnable| runnable.run())
    }

    /// Tasks ready to run right now.
    pub fn ready_count(&self) -> usize {
        self.shared.state.lock().ready.len()
    }

    /// Queued, delayed and reserved tasks.
    pub fn backlog(&self) -> usize {
        self.shared.state.lock().backlog()
    }

    pub fn thread_count(&self) -> usize {
        self.shared.thread_count
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.state.lock().shutting_down
    }

    /// Stops accepting work, discards queued tasks and waits for running
    /// tasks to finish, up to the configured timeout.
    ///
    /// Called from a worker thread, shutdown begins but does not wait.
    pub fn shutdown(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if !state.shutting_down {
                state.shutting_down = true;
                let dropped = state.ready.clear() + state.delayed.clear();
                info!(
                    "Shutting down task scheduler, discarding {} queued task(s)",
                    dropped
                );
            }
        }
        self.shared.available.notify_all();
        if context::is_scheduler_thread() {
            return Ok(());
        }

        let handles = std::mem::take(&mut *self.workers.lock());
        let deadline = Instant::now() + self.shutdown_timeout;
        let mut exited = 0;
        while exited < handles.len() {
            match self.exits.recv_deadline(deadline) {
                Ok(index) => {
                    trace!("Worker {} stopped", index);
                    exited += 1;
                }
                Err(_) => break,
            }
        }
        if exited < handles.len() {
            let running = handles.len() - exited;
            warn!(
                "{} worker(s) still running after {:?}",
                running, self.shutdown_timeout
            );
            return Err(ThothError::InvalidState(format!(
                "{} worker(s) still running after {:?}",
                running, self.shutdown_timeout
            )));
        }
        for handle in handles {
            if handle.join().is_err() {
                warn!("Worker thread panicked during shutdown");
            }
        }
        Ok(())
    }

    pub(crate) fn submit(&self, task: ScheduledTask, due: Option<Instant>) -> Result<()> {
        self.shared.enqueue(task, due, Admission::New)
    }

    pub(crate) fn reserve(
        &self,
        task: ScheduledTask,
        due: Option<Instant>,
    ) -> Result<TaskReservation> {
        self.shared.reserve()?;
        Ok(TaskReservation {
            shared: Arc::clone(&self.shared),
            task: Some(task),
            due,
        })
    }

    pub(crate) fn submit_recurring(
        &self,
        mut task: ScheduledTask,
        start: Instant,
        period: Duration,
    ) -> Result<RecurringTaskHandle> {
        if period.is_zero() {
            return Err(ThothError::InvalidState(
                "recurring period must be positive".to_string(),
            ));
        }
        if self.is_shutting_down() {
            return Err(ThothError::TaskRejected(
                "scheduler is shutting down".to_string(),
            ));
        }
        let state = Arc::new(RecurringState::new());
        task.recurrence = Some(Recurrence {
            state: Arc::clone(&state),
            period,
            due: start,
        });
        Ok(RecurringTaskHandle::new(
            Arc::clone(&self.shared),
            state,
            start,
            task,
        ))
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("Scheduler dropped uncleanly: {}", e);
        }
    }
}

/// A backlog slot held for one task.
///
/// Either [`use_reservation`](Self::use_reservation) or
/// [`cancel`](Self::cancel) consumes it; dropping it cancels.
pub struct TaskReservation {
    shared: Arc<Shared>,
    task: Option<ScheduledTask>,
    due: Option<Instant>,
}

impl TaskReservation {
    /// Queues the reserved task.
    pub fn use_reservation(mut self) -> Result<()> {
        let task = self.task.take().ok_or_else(|| {
            ThothError::InvalidState("reservation already used".to_string())
        })?;
        self.shared.enqueue(task, self.due, Admission::Reserved)
    }

    pub fn cancel(mut self) {
        if self.task.take().is_some() {
            self.shared.release_reservation();
        }
    }
}

impl Drop for TaskReservation {
    fn drop(&mut self) {
        if self.task.take().is_some() {
            self.shared.release_reservation();
        }
    }
}
