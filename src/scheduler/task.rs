use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::errors::{Result, ThothError};
use crate::owner::TaskOwner;
use crate::priority::Priority;
use crate::scheduler::recurring::RecurringState;

/// A unit of work the scheduler can run.
///
/// A recurring task runs once per period, so `run` takes `&self`. Plain
/// closures returning [`Result<()>`] implement this trait.
pub trait KernelRunnable: Send + Sync {
    /// The kind of task, used in logs and reports.
    fn base_task_type(&self) -> &str;

    fn run(&self) -> Result<()>;

    /// Whether the task runs inside a transaction.
    fn is_transactional(&self) -> bool {
        false
    }
}

impl<F> KernelRunnable for F
where
    F: Fn() -> Result<()> + Send + Sync,
{
    fn base_task_type(&self) -> &str {
        std::any::type_name::<F>()
    }

    fn run(&self) -> Result<()> {
        self()
    }
}

/// A closure task reported under a fixed type name.
pub struct NamedTask<F> {
    name: String,
    body: F,
}

impl<F> KernelRunnable for NamedTask<F>
where
    F: Fn() -> Result<()> + Send + Sync,
{
    fn base_task_type(&self) -> &str {
        &self.name
    }

    fn run(&self) -> Result<()> {
        (self.body)()
    }
}

/// Wraps a closure as a schedulable task.
pub fn runnable<F>(body: F) -> Arc<dyn KernelRunnable>
where
    F: Fn() -> Result<()> + Send + Sync + 'static,
{
    Arc::new(body)
}

/// Wraps a closure as a schedulable task named `name`.
pub fn named<F>(name: impl Into<String>, body: F) -> Arc<dyn KernelRunnable>
where
    F: Fn() -> Result<()> + Send + Sync + 'static,
{
    Arc::new(NamedTask {
        name: name.into(),
        body,
    })
}

/// What the scheduler should do after an attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { priority: Priority, delay: Duration },
    GiveUp,
}

/// The failed attempt a [`RetryPolicy`] is asked about.
pub struct AttemptFailure<'a> {
    pub task_type: &'a str,
    pub owner: &'a TaskOwner,
    pub priority: Priority,
    /// The attempt that failed, starting at 1.
    pub attempt: u32,
    pub error: &'a ThothError,
}

/// Decides whether a failed attempt runs again.
pub trait RetryPolicy: Send + Sync {
    fn on_failure(&self, failure: &AttemptFailure<'_>) -> RetryDecision;
}

pub(crate) struct Recurrence {
    pub(crate) state: Arc<RecurringState>,
    pub(crate) period: Duration,
    /// When the current firing was due.
    pub(crate) due: Instant,
}

pub(crate) struct ScheduledTask {
    pub(crate) runnable: Arc<dyn KernelRunnable>,
    pub(crate) owner: TaskOwner,
    pub(crate) priority: Priority,
    pub(crate) attempt: u32,
    pub(crate) retry: Option<Arc<dyn RetryPolicy>>,
    pub(crate) recurrence: Option<Recurrence>,
}

impl ScheduledTask {
    pub(crate) fn new(runnable: Arc<dyn KernelRunnable>, owner: TaskOwner, priority: Priority) -> Self {
        Self {
            runnable,
            owner,
            priority,
            attempt: 1,
            retry: None,
            recurrence: None,
        }
    }

    pub(crate) fn with_retry(mut self, policy: Option<Arc<dyn RetryPolicy>>) -> Self {
        self.retry = policy;
        self
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.recurrence
            .as_ref()
            .is_some_and(|r| r.state.is_cancelled())
    }

    /// The same task, run again after a failed attempt.
    pub(crate) fn retried(self, priority: Priority) -> Self {
        Self {
            priority,
            attempt: self.attempt + 1,
            ..self
        }
    }

    /// The next firing of a recurring task, or `None` for one-shot tasks.
    pub(crate) fn next_firing(&self, now: Instant) -> Option<(Instant, ScheduledTask)> {
        let recurrence = self.recurrence.as_ref()?;
        let due = (recurrence.due + recurrence.period).max(now);
        Some((
            due,
            ScheduledTask {
                runnable: Arc::clone(&self.runnable),
                owner: self.owner.clone(),
                priority: self.priority,
                attempt: 1,
                retry: self.retry.clone(),
                recurrence: Some(Recurrence {
                    state: Arc::clone(&recurrence.state),
                    period: recurrence.period,
                    due,
                }),
            },
        ))
    }
}
