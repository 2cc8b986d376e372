pub mod access;
pub mod config;
pub mod conflict;
pub mod context;
pub mod coordinator;
pub mod errors;
pub mod handler;
pub mod owner;
pub mod priority;
pub mod profile;
pub mod runtime;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod transaction;
pub mod twopc;

// Re-export key types and structs for easier access
pub use access::{AccessCoordinator, AccessReporter, AccessType, ObjectId};
pub use config::{RetryConfig, RetryPriority, ThothConfig};
pub use conflict::detection::ConflictChecker;
pub use conflict::resolution::{ConflictMode, ConflictResolver, OldestWins};
pub use coordinator::{Clock, ManualClock, SystemClock, TransactionCoordinator, TransactionHandle};
pub use errors::{Result, Retry, ThothError};
pub use handler::TaskHandler;
pub use owner::{AppContext, Identity, TaskFailure, TaskFailureListener, TaskOwner};
pub use priority::Priority;
pub use profile::{ProfileListener, TaskReport};
pub use scheduler::{KernelRunnable, TaskReservation, TaskScheduler};
pub use service::{DurableTask, PeriodicTaskHandle, TaskFactory, TaskService};
pub use store::{MemoryTaskStore, PendingTask, TaskStore, TaskStoreMutation};
pub use runtime::{Thoth, prelude};
pub use transaction::{Transaction, TransactionId, TransactionState};
pub use twopc::{ParticipantKind, TransactionParticipant, Vote};
