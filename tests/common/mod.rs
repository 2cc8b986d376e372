//! Common utilities for Thoth integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thoth::prelude::*;

/// Routes `log` output through env_logger once per test binary.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A small configuration suited to tests.
pub fn test_config(workers: usize) -> ThothConfig {
    ThothConfig {
        worker_threads: workers,
        shutdown_timeout: Duration::from_secs(2),
        retry: RetryConfig {
            max_attempts: Some(5),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Helper function to create a Thoth runtime over `store`.
pub fn setup_thoth(config: ThothConfig, store: Arc<MemoryTaskStore>) -> Thoth {
    init_logging();
    Thoth::new(config, store, AppContext::new("test-app")).unwrap()
}

/// Same as [`setup_thoth`], with failures reported to a [`FailureLog`].
pub fn setup_thoth_with_failures(
    config: ThothConfig,
    store: Arc<MemoryTaskStore>,
) -> (Thoth, Arc<FailureLog>) {
    init_logging();
    let failures = Arc::new(FailureLog::default());
    let context = AppContext::with_listener("test-app", failures.clone());
    (Thoth::new(config, store, context).unwrap(), failures)
}

/// Records every failure the task service gives up on.
#[derive(Default)]
pub struct FailureLog {
    failures: Mutex<Vec<TaskFailure>>,
}

impl FailureLog {
    pub fn failures(&self) -> Vec<TaskFailure> {
        self.failures.lock().clone()
    }
}

impl TaskFailureListener for FailureLog {
    fn task_failed(&self, failure: &TaskFailure) {
        self.failures.lock().push(failure.clone());
    }
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}
