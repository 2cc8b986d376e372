use std::sync::Arc;

use log::info;

use crate::access::{AccessCoordinator, AccessReporter, ObjectKey};
use crate::config::ThothConfig;
use crate::coordinator::{Clock, SystemClock, TransactionCoordinator};
use crate::errors::Result;
use crate::handler::TaskHandler;
use crate::owner::{AppContext, Identity, TaskOwner};
use crate::profile::ProfileListener;
use crate::scheduler::TaskScheduler;
use crate::service::TaskService;
use crate::store::TaskStore;

/// Thoth Prelude
pub mod prelude {
    pub use crate::access::*;
    pub use crate::config::*;
    pub use crate::conflict::detection::{ConflictChecker, ConflictResult};
    pub use crate::conflict::resolution::*;
    pub use crate::context::*;
    pub use crate::coordinator::*;
    pub use crate::errors::*;
    pub use crate::handler::*;
    pub use crate::owner::*;
    pub use crate::priority::*;
    pub use crate::profile::*;
    pub use crate::runtime::Thoth;
    pub use crate::scheduler::recurring::RecurringTaskHandle;
    pub use crate::scheduler::*;
    pub use crate::service::*;
    pub use crate::store::*;
    pub use crate::transaction::*;
    pub use crate::twopc::*;
}

/// The main entry point: one scheduler, one transaction coordinator and one
/// task service for a single application context.
pub struct Thoth {
    config: ThothConfig,
    access: Arc<AccessCoordinator>,
    coordinator: Arc<TransactionCoordinator>,
    handler: Arc<TaskHandler>,
    scheduler: Arc<TaskScheduler>,
    service: TaskService,
}

impl Thoth {
    pub fn new(
        config: ThothConfig,
        store: Arc<dyn TaskStore>,
        context: Arc<AppContext>,
    ) -> Result<Self> {
        Self::with_clock(config, store, context, Arc::new(SystemClock), Vec::new())
    }

    /// Builds the runtime with an explicit transaction clock and profile
    /// listeners registered before any worker starts.
    pub fn with_clock(
        config: ThothConfig,
        store: Arc<dyn TaskStore>,
        context: Arc<AppContext>,
        clock: Arc<dyn Clock>,
        listeners: Vec<Arc<dyn ProfileListener>>,
    ) -> Result<Self> {
        config.validate()?;
        let access = Arc::new(AccessCoordinator::new(config.conflict_mode));
        let coordinator = Arc::new(TransactionCoordinator::with_clock(
            Arc::clone(&access),
            clock,
        ));
        let handler = Arc::new(TaskHandler::new(Arc::clone(&coordinator))?);
        let scheduler = Arc::new(TaskScheduler::with_listeners(&config, listeners)?);
        let service = TaskService::new(
            Arc::clone(&scheduler),
            Arc::clone(&handler),
            store,
            context,
            config.retry.clone(),
        )?;
        info!(
            "Thoth started for {} in {:?} conflict mode",
            service.context().name(),
            config.conflict_mode
        );
        Ok(Self {
            config,
            access,
            coordinator,
            handler,
            scheduler,
            service,
        })
    }

    pub fn config(&self) -> &ThothConfig {
        &self.config
    }

    pub fn access_coordinator(&self) -> &Arc<AccessCoordinator> {
        &self.access
    }

    pub fn transaction_coordinator(&self) -> &Arc<TransactionCoordinator> {
        &self.coordinator
    }

    pub fn handler(&self) -> &Arc<TaskHandler> {
        &self.handler
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    pub fn service(&self) -> &TaskService {
        &self.service
    }

    /// Registers a named source of shared objects keyed by `K`.
    pub fn register_access_source<K: ObjectKey>(&self, name: &str) -> AccessReporter<K> {
        self.access.register_access_source::<K>(name)
    }

    /// An owner running as `identity` in this runtime's context.
    pub fn owner(&self, identity: impl AsRef<str>) -> TaskOwner {
        TaskOwner::new(Identity::new(identity), Arc::clone(self.service.context()))
    }

    /// Stops the scheduler. Queued tasks are discarded; durable ones stay in
    /// the store for the next [`TaskService::recover`].
    pub fn shutdown(&self) -> Result<()> {
        self.scheduler.shutdown()
    }
}
