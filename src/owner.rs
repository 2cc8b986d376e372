use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::warn;
use parking_lot::Mutex;

use crate::errors::ThothError;

/// The principal a task runs as.
///
/// Equality is by name, so two identities built from the same name are the
/// same principal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity(Arc<str>);

impl Identity {
    pub fn new(name: impl AsRef<str>) -> Self {
        Identity(Arc::from(name.as_ref()))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A non-retryable failure surfaced to the application that owns the task.
#[derive(Debug, Clone)]
pub struct TaskFailure {
    pub task_type: String,
    pub identity: Identity,
    pub error: ThothError,
    pub attempts: u32,
}

/// Receives failures that the task service gave up on.
pub trait TaskFailureListener: Send + Sync {
    fn task_failed(&self, failure: &TaskFailure);
}

/// The application environment tasks run in.
pub struct AppContext {
    name: String,
    listener: Option<Arc<dyn TaskFailureListener>>,
    halted: AtomicBool,
    halt_cause: Mutex<Option<ThothError>>,
}

impl AppContext {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            listener: None,
            halted: AtomicBool::new(false),
            halt_cause: Mutex::new(None),
        })
    }

    pub fn with_listener(
        name: impl Into<String>,
        listener: Arc<dyn TaskFailureListener>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            listener: Some(listener),
            halted: AtomicBool::new(false),
            halt_cause: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `true` once a startup-critical task has failed.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// The failure that halted this context, if any.
    pub fn halt_cause(&self) -> Option<ThothError> {
        self.halt_cause.lock().clone()
    }

    pub(crate) fn notify_failure(&self, failure: &TaskFailure) {
        warn!(
            "Task {} owned by {} in {} failed after {} attempt(s): {}",
            failure.task_type, failure.identity, self.name, failure.attempts, failure.error
        );
        if let Some(listener) = &self.listener {
            listener.task_failed(failure);
        }
    }

    pub(crate) fn halt(&self, cause: ThothError) {
        let mut slot = self.halt_cause.lock();
        if slot.is_none() {
            warn!("Application context {} halted: {}", self.name, cause);
            *slot = Some(cause);
        }
        self.halted.store(true, Ordering::Release);
    }
}

impl fmt::Debug for AppContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppContext")
            .field("name", &self.name)
            .field("halted", &self.is_halted())
            .finish()
    }
}

/// Who a task runs as and in which application context.
#[derive(Debug, Clone)]
pub struct TaskOwner {
    identity: Identity,
    context: Arc<AppContext>,
}

impl TaskOwner {
    pub fn new(identity: Identity, context: Arc<AppContext>) -> Self {
        Self { identity, context }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn context(&self) -> &Arc<AppContext> {
        &self.context
    }
}

impl PartialEq for TaskOwner {
    fn eq(&self, other: &Self) -> bool {
        self.identity == other.identity && Arc::ptr_eq(&self.context, &other.context)
    }
}

impl Eq for TaskOwner {}

impl fmt::Display for TaskOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.identity, self.context.name)
    }
}
