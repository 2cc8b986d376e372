mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use thoth::prelude::*;

use common::{setup_thoth, setup_thoth_with_failures, test_config, wait_until};

/// Appends its payload to a shared journal.
struct JournalEntry {
    line: String,
    journal: Arc<Mutex<Vec<String>>>,
}

impl DurableTask for JournalEntry {
    fn task_type(&self) -> &str {
        "journal"
    }

    fn payload(&self) -> String {
        self.line.clone()
    }

    fn run(&self) -> Result<()> {
        self.journal.lock().push(self.line.clone());
        Ok(())
    }
}

fn register_journal(thoth: &Thoth, journal: &Arc<Mutex<Vec<String>>>) {
    let journal = Arc::clone(journal);
    thoth.service().register_task_type(
        "journal",
        Arc::new(move |payload: &str| -> Result<Arc<dyn DurableTask>> {
            Ok(Arc::new(JournalEntry {
                line: payload.to_string(),
                journal: Arc::clone(&journal),
            }))
        }),
    );
}

#[test]
fn conflicting_tasks_are_retried_until_both_commit() {
    let config = ThothConfig {
        retry: RetryConfig {
            max_attempts: Some(20),
            backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(100),
            ..Default::default()
        },
        ..test_config(2)
    };
    let thoth = setup_thoth(config, Arc::new(MemoryTaskStore::new()));
    let reporter = thoth.register_access_source::<&'static str>("documents");
    let owner = thoth.owner("editor");
    let committed = Arc::new(AtomicUsize::new(0));
    let younger_attempts = Arc::new(AtomicUsize::new(0));
    let (holding_tx, holding_rx) = crossbeam_channel::unbounded::<()>();
    let (refused_tx, refused_rx) = crossbeam_channel::unbounded::<()>();

    struct Committed(Arc<AtomicUsize>);
    impl TransactionParticipant for Committed {
        fn name(&self) -> &str {
            "committed"
        }
        fn prepare(&self, _txn: &Transaction) -> Result<Vote> {
            Ok(Vote::Prepared)
        }
        fn commit(&self, _txn: &Transaction) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn abort(&self, _txn: &Transaction) -> Result<()> {
            Ok(())
        }
    }

    let older = {
        let reporter = reporter.clone();
        let committed = Arc::clone(&committed);
        named("older", move || {
            reporter.report_access("doc", AccessType::Write)?;
            let _ = holding_tx.send(());
            let _ = refused_rx.recv_timeout(Duration::from_secs(5));
            current_transaction()?.join(Arc::new(Committed(Arc::clone(&committed))))
        })
    };
    thoth.service().schedule_non_durable_task(older, &owner).unwrap();
    holding_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let younger = {
        let committed = Arc::clone(&committed);
        let attempts = Arc::clone(&younger_attempts);
        named("younger", move || {
            attempts.fetch_add(1, Ordering::SeqCst);
            let outcome = reporter.report_access("doc", AccessType::Write);
            if outcome.is_err() {
                let _ = refused_tx.send(());
            }
            outcome?;
            current_transaction()?.join(Arc::new(Committed(Arc::clone(&committed))))
        })
    };
    thoth.service().schedule_non_durable_task(younger, &owner).unwrap();

    assert!(wait_until(Duration::from_secs(5), || committed.load(Ordering::SeqCst) == 2));
    assert!(younger_attempts.load(Ordering::SeqCst) >= 2);
    thoth.shutdown().unwrap();
}

#[test]
fn durable_tasks_survive_a_restart() {
    let store = Arc::new(MemoryTaskStore::new());
    let journal = Arc::new(Mutex::new(Vec::new()));

    let first = setup_thoth(test_config(1), store.clone());
    register_journal(&first, &journal);
    let owner = first.owner("writer");
    let one_shot = first
        .service()
        .schedule_delayed_task(
            Arc::new(JournalEntry {
                line: "hello".to_string(),
                journal: Arc::clone(&journal),
            }),
            &owner,
            Duration::from_millis(300),
        )
        .unwrap();
    let periodic = first
        .service()
        .schedule_periodic_task(
            Arc::new(JournalEntry {
                line: "tick".to_string(),
                journal: Arc::clone(&journal),
            }),
            &owner,
            Duration::from_secs(60),
            Duration::from_millis(50),
        )
        .unwrap();
    first.shutdown().unwrap();
    drop(first);
    assert_eq!(store.len(), 2);
    assert!(store.get(periodic.id()).unwrap().is_periodic());
    assert!(journal.lock().is_empty());

    store
        .apply_mutations(vec![TaskStoreMutation::Insert(PendingTask {
            id: 99,
            task_type: "retired".to_string(),
            payload: String::new(),
            identity: "writer".to_string(),
            priority: Priority::Low,
            start_time: 0,
            period_millis: None,
        })])
        .unwrap();

    let second = setup_thoth(test_config(1), store.clone());
    register_journal(&second, &journal);
    assert_eq!(second.service().recover().unwrap(), 2);

    assert!(wait_until(Duration::from_secs(3), || {
        store.get(one_shot).is_none() && journal.lock().iter().any(|l| l == "hello")
    }));
    assert!(store.get(99).is_some());

    let recovered = second.service().periodic_task(periodic.id()).unwrap();
    recovered.cancel().unwrap();
    recovered.cancel().unwrap();
    assert!(store.get(periodic.id()).is_none());
    assert!(second.service().periodic_task(periodic.id()).is_none());

    let fresh = second
        .service()
        .schedule_task(
            Arc::new(JournalEntry {
                line: "again".to_string(),
                journal: Arc::clone(&journal),
            }),
            &second.owner("writer"),
        )
        .unwrap();
    assert!(fresh > 99);
    second.shutdown().unwrap();
}

#[test]
fn periodic_tasks_fire_until_cancelled() {
    let store = Arc::new(MemoryTaskStore::new());
    let journal = Arc::new(Mutex::new(Vec::new()));
    let thoth = setup_thoth(test_config(2), store.clone());
    register_journal(&thoth, &journal);

    let handle = thoth
        .service()
        .schedule_periodic_task(
            Arc::new(JournalEntry {
                line: "tick".to_string(),
                journal: Arc::clone(&journal),
            }),
            &thoth.owner("clock"),
            Duration::ZERO,
            Duration::from_millis(20),
        )
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || journal.lock().len() >= 3));
    assert!(store.get(handle.id()).is_some());

    handle.cancel().unwrap();
    assert!(store.is_empty());
    std::thread::sleep(Duration::from_millis(50));
    let settled = journal.lock().len();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(journal.lock().len(), settled);
    thoth.shutdown().unwrap();
}

#[test]
fn exhausted_and_fatal_failures_reach_the_listener() {
    let config = ThothConfig {
        retry: RetryConfig {
            max_attempts: Some(3),
            retry_priority: RetryPriority::Higher,
            ..Default::default()
        },
        ..test_config(1)
    };
    let (thoth, failures) = setup_thoth_with_failures(config, Arc::new(MemoryTaskStore::new()));
    let owner = thoth.owner("worker");
    let attempts = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&attempts);
    thoth
        .service()
        .schedule_non_durable_task(
            named("flaky", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ThothError::retryable("still busy"))
            }),
            &owner,
        )
        .unwrap();
    thoth
        .service()
        .schedule_non_durable_task(named("broken", || Err(ThothError::fatal("bad input"))), &owner)
        .unwrap();

    assert!(wait_until(Duration::from_secs(3), || failures.failures().len() == 2));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    let failures = failures.failures();
    let flaky = failures.iter().find(|f| f.task_type == "flaky").unwrap();
    assert_eq!(flaky.attempts, 3);
    assert_eq!(flaky.identity, Identity::new("worker"));
    assert!(matches!(
        flaky.error,
        ThothError::RetryLimitExceeded { attempts: 3, .. }
    ));
    let broken = failures.iter().find(|f| f.task_type == "broken").unwrap();
    assert_eq!(broken.attempts, 1);
    assert!(!broken.error.should_retry());
    assert!(!thoth.service().context().is_halted());
    thoth.shutdown().unwrap();
}

#[test]
fn failed_startup_task_halts_the_context() {
    let (thoth, failures) =
        setup_thoth_with_failures(test_config(1), Arc::new(MemoryTaskStore::new()));
    let owner = thoth.owner("boot");
    thoth
        .service()
        .schedule_startup_task(
            named("load-schema", || Err(ThothError::fatal("schema missing"))),
            &owner,
        )
        .unwrap();

    let context = Arc::clone(thoth.service().context());
    assert!(wait_until(Duration::from_secs(2), || context.is_halted()));
    assert!(context.halt_cause().is_some());
    assert_eq!(failures.failures().len(), 1);
    assert!(matches!(
        thoth
            .service()
            .schedule_non_durable_task(runnable(|| Ok(())), &owner),
        Err(ThothError::TaskRejected(_))
    ));
    thoth.shutdown().unwrap();
}

#[test]
fn tasks_scheduled_by_an_aborted_task_never_run() {
    let store = Arc::new(MemoryTaskStore::new());
    let journal = Arc::new(Mutex::new(Vec::new()));
    let thoth = Arc::new(setup_thoth(test_config(2), store.clone()));
    register_journal(&thoth, &journal);
    let owner = thoth.owner("planner");
    let parent_runs = Arc::new(AtomicUsize::new(0));

    let parent = {
        let thoth = Arc::clone(&thoth);
        let journal = Arc::clone(&journal);
        let owner = owner.clone();
        let runs = Arc::clone(&parent_runs);
        named("planner", move || {
            let attempt = runs.fetch_add(1, Ordering::SeqCst) + 1;
            thoth.service().schedule_task(
                Arc::new(JournalEntry {
                    line: format!("from attempt {}", attempt),
                    journal: Arc::clone(&journal),
                }),
                &owner,
            )?;
            if attempt == 1 {
                return Err(ThothError::retryable("first attempt loses"));
            }
            Ok(())
        })
    };
    thoth.service().schedule_non_durable_task(parent, &owner).unwrap();

    assert!(wait_until(Duration::from_secs(3), || !journal.lock().is_empty()
        && store.is_empty()));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(*journal.lock(), vec!["from attempt 2".to_string()]);
    assert_eq!(parent_runs.load(Ordering::SeqCst), 2);
    thoth.shutdown().unwrap();
}
