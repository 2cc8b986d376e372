use std::sync::Arc;

use ahash::{AHashMap as HashMap, RandomState};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::{debug, trace};

use crate::access::{AccessType, Description, ObjectId};
use crate::conflict::resolution::{ConflictMode, ConflictResolver, Loser};
use crate::errors::{Result, ThothError};
use crate::transaction::{Transaction, TransactionId, TransactionState};
use crate::twopc::{ParticipantKind, TransactionParticipant, Vote};

/// Outcome of a conflict check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictResult {
    NoConflict,
    /// The requesting transaction lost and must abort.
    SelfAbort,
    /// The listed transactions lost and were doomed in the requester's favor.
    OtherAbort(Vec<TransactionId>),
}

struct Holder {
    txn: Arc<Transaction>,
    access: AccessType,
}

#[derive(Default)]
struct ObjectHolders {
    holders: Vec<Holder>,
}

impl ObjectHolders {
    fn prune(&mut self) {
        self.holders.retain(|h| h.txn.holds_accesses());
    }
}

struct AccessRecord {
    access: AccessType,
    source: Arc<str>,
    description: Option<Description>,
}

struct TransactionTable {
    resolver: Arc<dyn ConflictResolver>,
    accesses: HashMap<ObjectId, AccessRecord>,
    // Descriptions set before the object was accessed.
    pending_descriptions: HashMap<ObjectId, Description>,
}

fn conflicts(a: AccessType, b: AccessType) -> bool {
    a == AccessType::Write || b == AccessType::Write
}

/// Tracks object accesses per transaction and decides conflicts.
///
/// In [`ConflictMode::FailFast`] every conflict is decided the moment it is
/// reported: the resolver picks a loser, and a losing holder is doomed so
/// that its next access, join or commit fails. A transaction that is already
/// preparing or committed never loses; a requester that conflicts with one
/// aborts itself instead.
///
/// Per-object and per-transaction state live in separate sharded maps. No
/// code path holds a guard on both maps at once.
pub struct ConflictChecker {
    mode: ConflictMode,
    objects: DashMap<ObjectId, ObjectHolders, RandomState>,
    transactions: DashMap<TransactionId, TransactionTable, RandomState>,
}

impl ConflictChecker {
    pub fn new(mode: ConflictMode) -> Self {
        Self {
            mode,
            objects: DashMap::with_hasher(RandomState::new()),
            transactions: DashMap::with_hasher(RandomState::new()),
        }
    }

    pub fn mode(&self) -> ConflictMode {
        self.mode
    }

    /// Starts tracking `txn` and joins the checker to it as a participant.
    pub fn started(
        self: &Arc<Self>,
        txn: &Arc<Transaction>,
        resolver: Arc<dyn ConflictResolver>,
    ) -> Result<()> {
        match self.transactions.entry(txn.id().clone()) {
            Entry::Occupied(_) => Err(ThothError::InvalidState(format!(
                "transaction {} is already tracked",
                txn.id()
            ))),
            Entry::Vacant(vacant) => {
                txn.join(Arc::clone(self) as Arc<dyn TransactionParticipant>)?;
                vacant.insert(TransactionTable {
                    resolver,
                    accesses: HashMap::new(),
                    pending_descriptions: HashMap::new(),
                });
                trace!("Tracking accesses for transaction {}", txn.id());
                Ok(())
            }
        }
    }

    /// Records an access by `txn` and decides any conflict it causes.
    pub fn check_access(
        &self,
        txn: &Arc<Transaction>,
        obj: ObjectId,
        access: AccessType,
        source: &Arc<str>,
    ) -> Result<ConflictResult> {
        if txn.is_doomed() {
            return Ok(ConflictResult::SelfAbort);
        }
        txn.check_active()?;

        let resolver = match self.transactions.get(txn.id()) {
            Some(table) => {
                if table.accesses.get(&obj).is_some_and(|r| r.access >= access) {
                    return Ok(ConflictResult::NoConflict);
                }
                Arc::clone(&table.resolver)
            }
            None => return self.untracked(txn),
        };

        let mut losers: Vec<Arc<Transaction>> = Vec::new();
        {
            let mut entry = self.objects.entry(obj.clone()).or_default();
            entry.prune();
            let rivals: Vec<Arc<Transaction>> = entry
                .holders
                .iter()
                .filter(|h| h.txn.id() != txn.id() && conflicts(access, h.access))
                .map(|h| Arc::clone(&h.txn))
                .collect();

            if !rivals.is_empty() {
                match self.mode {
                    ConflictMode::Advisory => {
                        debug!(
                            "Ignoring {} conflicting holder(s) of {} for {}",
                            rivals.len(),
                            obj,
                            txn.id()
                        );
                    }
                    ConflictMode::FailFast => {
                        let requester_loses = rivals.iter().any(|other| {
                            other.state() != TransactionState::Active
                                || resolver.resolve(txn, other) == Loser::Requester
                        });
                        if requester_loses {
                            drop(entry);
                            return Ok(self.self_abort(txn, &obj, access));
                        }
                        for other in rivals {
                            let cause = ThothError::TransactionConflict {
                                txn: other.id().clone(),
                                reason: format!(
                                    "{:?} access to {} by older transaction {}",
                                    access,
                                    obj,
                                    txn.id()
                                ),
                            };
                            if !other.try_doom(cause) {
                                drop(entry);
                                self.release_losers(&losers);
                                return Ok(self.self_abort(txn, &obj, access));
                            }
                            losers.push(other);
                        }
                        entry
                            .holders
                            .retain(|h| !losers.iter().any(|l| l.id() == h.txn.id()));
                    }
                }
            }

            match entry.holders.iter_mut().find(|h| h.txn.id() == txn.id()) {
                Some(holder) => holder.access = holder.access.max(access),
                None => entry.holders.push(Holder {
                    txn: Arc::clone(txn),
                    access,
                }),
            }
        }

        let recorded = match self.transactions.get_mut(txn.id()) {
            Some(mut table) => {
                let table = &mut *table;
                let description = table.pending_descriptions.remove(&obj);
                let record = table
                    .accesses
                    .entry(obj.clone())
                    .or_insert_with(|| AccessRecord {
                        access,
                        source: Arc::clone(source),
                        description: None,
                    });
                record.access = record.access.max(access);
                if description.is_some() {
                    record.description = description;
                }
                true
            }
            None => false,
        };
        if !recorded {
            // Released by a concurrent abort while the object was updated.
            self.release_object(&obj, txn.id());
            self.release_losers(&losers);
            return self.untracked(txn);
        }

        if losers.is_empty() {
            Ok(ConflictResult::NoConflict)
        } else {
            self.release_losers(&losers);
            Ok(ConflictResult::OtherAbort(
                losers.iter().map(|l| l.id().clone()).collect(),
            ))
        }
    }

    /// Validates `txn` and stops tracking it.
    ///
    /// A transaction validated this way commits without a further check.
    pub fn validate(&self, txn: &Transaction) -> Result<ConflictResult> {
        let result = self.verify(txn)?;
        self.release_transaction(txn.id());
        Ok(result)
    }

    /// Stops tracking `txn` and releases everything it holds. Idempotent.
    pub fn abort_transaction(&self, txn: &Transaction) {
        if self.release_transaction(txn.id()) {
            trace!("Released accesses of aborted transaction {}", txn.id());
        }
    }

    /// Attaches a description to an object accessed by `txn`.
    ///
    /// The description is kept until the object is accessed when it has not
    /// been accessed yet.
    pub fn set_description(
        &self,
        txn: &Transaction,
        obj: ObjectId,
        description: Description,
    ) -> Result<()> {
        match self.transactions.get_mut(txn.id()) {
            Some(mut table) => {
                let table = &mut *table;
                match table.accesses.get_mut(&obj) {
                    Some(record) => record.description = Some(description),
                    None => {
                        table.pending_descriptions.insert(obj, description);
                    }
                }
                Ok(())
            }
            None if txn.is_doomed() => Ok(()),
            None => Err(ThothError::InvalidState(format!(
                "transaction {} is not tracked",
                txn.id()
            ))),
        }
    }

    /// Live holders of `obj` and their strongest access.
    pub fn holders(&self, obj: &ObjectId) -> Vec<(TransactionId, AccessType)> {
        self.objects
            .get(obj)
            .map(|entry| {
                entry
                    .holders
                    .iter()
                    .filter(|h| h.txn.holds_accesses())
                    .map(|h| (h.txn.id().clone(), h.access))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The access `id` recorded on `obj` and the source that reported it.
    pub fn access(&self, id: &TransactionId, obj: &ObjectId) -> Option<(AccessType, String)> {
        self.transactions.get(id).and_then(|table| {
            table
                .accesses
                .get(obj)
                .map(|r| (r.access, r.source.to_string()))
        })
    }

    pub fn description(&self, id: &TransactionId, obj: &ObjectId) -> Option<Description> {
        self.transactions
            .get(id)
            .and_then(|table| table.accesses.get(obj).and_then(|r| r.description.clone()))
    }

    pub fn is_tracking(&self, id: &TransactionId) -> bool {
        self.transactions.contains_key(id)
    }

    pub fn tracked_transactions(&self) -> usize {
        self.transactions.len()
    }

    pub fn tracked_objects(&self) -> usize {
        self.objects.len()
    }

    /// Checks that `txn` still holds every recorded access without a live
    /// conflicting holder. Leaves the accesses in place.
    fn verify(&self, txn: &Transaction) -> Result<ConflictResult> {
        let accesses: Vec<(ObjectId, AccessType)> = match self.transactions.get(txn.id()) {
            Some(table) => table
                .accesses
                .iter()
                .map(|(obj, record)| (obj.clone(), record.access))
                .collect(),
            None if txn.is_doomed() => return Ok(ConflictResult::SelfAbort),
            None => {
                return Err(ThothError::InvalidState(format!(
                    "transaction {} is not tracked",
                    txn.id()
                )));
            }
        };
        if txn.is_doomed() {
            return Ok(ConflictResult::SelfAbort);
        }
        if self.mode == ConflictMode::Advisory {
            return Ok(ConflictResult::NoConflict);
        }

        for (obj, access) in accesses {
            let intact = self.objects.get(&obj).is_some_and(|entry| {
                let held = entry.holders.iter().any(|h| h.txn.id() == txn.id());
                let rival = entry.holders.iter().any(|h| {
                    h.txn.id() != txn.id() && conflicts(access, h.access) && h.txn.holds_accesses()
                });
                held && !rival
            });
            if !intact {
                debug!("Transaction {} lost its access to {}", txn.id(), obj);
                return Ok(ConflictResult::SelfAbort);
            }
        }
        Ok(ConflictResult::NoConflict)
    }

    fn untracked(&self, txn: &Transaction) -> Result<ConflictResult> {
        if txn.is_doomed() {
            Ok(ConflictResult::SelfAbort)
        } else {
            Err(ThothError::InvalidState(format!(
                "transaction {} is not tracked",
                txn.id()
            )))
        }
    }

    fn self_abort(&self, txn: &Transaction, obj: &ObjectId, access: AccessType) -> ConflictResult {
        let cause = ThothError::TransactionConflict {
            txn: txn.id().clone(),
            reason: format!("{:?} access to {} conflicts with an older holder", access, obj),
        };
        txn.try_doom(cause);
        debug!("Transaction {} aborts itself over {}", txn.id(), obj);
        self.release_transaction(txn.id());
        ConflictResult::SelfAbort
    }

    fn release_losers(&self, losers: &[Arc<Transaction>]) {
        for loser in losers {
            self.release_transaction(loser.id());
        }
    }

    fn release_transaction(&self, id: &TransactionId) -> bool {
        match self.transactions.remove(id) {
            Some((_, table)) => {
                for obj in table.accesses.keys() {
                    self.release_object(obj, id);
                }
                true
            }
            None => false,
        }
    }

    fn release_object(&self, obj: &ObjectId, id: &TransactionId) {
        if let Some(mut entry) = self.objects.get_mut(obj) {
            entry.holders.retain(|h| h.txn.id() != id);
        }
        self.objects.remove_if(obj, |_, entry| entry.holders.is_empty());
    }
}

impl TransactionParticipant for ConflictChecker {
    fn name(&self) -> &str {
        "conflict-checker"
    }

    fn kind(&self) -> ParticipantKind {
        ParticipantKind::NonDurable
    }

    fn prepare(&self, txn: &Transaction) -> Result<Vote> {
        // Already validated explicitly.
        if !txn.is_doomed() && !self.transactions.contains_key(txn.id()) {
            return Ok(Vote::ReadOnly);
        }
        match self.verify(txn)? {
            ConflictResult::SelfAbort => Err(ThothError::TransactionConflict {
                txn: txn.id().clone(),
                reason: "lost a conflict before commit".to_string(),
            }),
            ConflictResult::NoConflict | ConflictResult::OtherAbort(_) => Ok(Vote::Prepared),
        }
    }

    // Accesses stay held while durable participants commit.
    fn commit(&self, txn: &Transaction) -> Result<()> {
        self.release_transaction(txn.id());
        Ok(())
    }

    fn abort(&self, txn: &Transaction) -> Result<()> {
        self.abort_transaction(txn);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::resolution::OldestWins;
    use parking_lot::Mutex;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::thread;

    fn checker(mode: ConflictMode) -> Arc<ConflictChecker> {
        Arc::new(ConflictChecker::new(mode))
    }

    fn begin(checker: &Arc<ConflictChecker>, counter: u64, time: u64) -> Arc<Transaction> {
        let txn = Arc::new(Transaction::new(TransactionId::from_counter(counter), time));
        checker.started(&txn, Arc::new(OldestWins)).unwrap();
        txn
    }

    fn source() -> Arc<str> {
        Arc::from("test")
    }

    fn object(name: &str) -> ObjectId {
        ObjectId::new("test", name.to_string())
    }

    #[test]
    fn younger_writer_aborts_itself() {
        let checker = checker(ConflictMode::FailFast);
        let t1 = begin(&checker, 1, 100);
        let t2 = begin(&checker, 2, 200);
        let x = object("x");

        assert_eq!(
            checker.check_access(&t1, x.clone(), AccessType::Write, &source()).unwrap(),
            ConflictResult::NoConflict
        );
        assert_eq!(
            checker.check_access(&t2, x.clone(), AccessType::Write, &source()).unwrap(),
            ConflictResult::SelfAbort
        );
        assert!(t2.is_doomed());
        assert!(t1.is_active());
        assert!(!checker.is_tracking(t2.id()));

        assert_eq!(checker.validate(&t1).unwrap(), ConflictResult::NoConflict);
        assert_eq!(checker.tracked_objects(), 0);
        t1.commit().unwrap();
    }

    #[test]
    fn older_writer_dooms_the_holder() {
        let checker = checker(ConflictMode::FailFast);
        let t1 = begin(&checker, 1, 100);
        let t2 = begin(&checker, 2, 200);
        let x = object("x");

        checker.check_access(&t2, x.clone(), AccessType::Write, &source()).unwrap();
        assert_eq!(
            checker.check_access(&t1, x.clone(), AccessType::Write, &source()).unwrap(),
            ConflictResult::OtherAbort(vec![t2.id().clone()])
        );
        assert!(t2.is_doomed());
        assert!(t2.check_active().unwrap_err().is_conflict());
        assert_eq!(
            checker.check_access(&t2, object("y"), AccessType::Read, &source()).unwrap(),
            ConflictResult::SelfAbort
        );
        assert_eq!(checker.holders(&x), vec![(t1.id().clone(), AccessType::Write)]);
    }

    #[test]
    fn equal_times_break_ties_by_id() {
        let checker = checker(ConflictMode::FailFast);
        let a = begin(&checker, 1, 100);
        let b = begin(&checker, 2, 100);
        let x = object("x");

        checker.check_access(&a, x.clone(), AccessType::Write, &source()).unwrap();
        assert_eq!(
            checker.check_access(&b, x, AccessType::Write, &source()).unwrap(),
            ConflictResult::SelfAbort
        );
    }

    #[test]
    fn readers_share_until_a_writer_arrives() {
        let checker = checker(ConflictMode::FailFast);
        let t1 = begin(&checker, 1, 100);
        let t2 = begin(&checker, 2, 200);
        let x = object("x");

        for txn in [&t1, &t2] {
            assert_eq!(
                checker.check_access(txn, x.clone(), AccessType::Read, &source()).unwrap(),
                ConflictResult::NoConflict
            );
        }
        assert_eq!(checker.holders(&x).len(), 2);

        let young = begin(&checker, 3, 300);
        assert_eq!(
            checker.check_access(&young, x.clone(), AccessType::Write, &source()).unwrap(),
            ConflictResult::SelfAbort
        );

        let old = begin(&checker, 4, 50);
        match checker.check_access(&old, x.clone(), AccessType::Write, &source()).unwrap() {
            ConflictResult::OtherAbort(mut losers) => {
                losers.sort();
                assert_eq!(losers, vec![t1.id().clone(), t2.id().clone()]);
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn upgrading_own_read_does_not_conflict() {
        let checker = checker(ConflictMode::FailFast);
        let t1 = begin(&checker, 1, 100);
        let x = object("x");

        checker.check_access(&t1, x.clone(), AccessType::Read, &source()).unwrap();
        assert_eq!(
            checker.check_access(&t1, x.clone(), AccessType::Write, &source()).unwrap(),
            ConflictResult::NoConflict
        );
        assert_eq!(checker.holders(&x), vec![(t1.id().clone(), AccessType::Write)]);
        assert_eq!(
            checker.access(t1.id(), &x),
            Some((AccessType::Write, "test".to_string()))
        );
    }

    /// Durable participant that reports an access for another transaction
    /// while its own transaction is preparing.
    struct LateRival {
        checker: Arc<ConflictChecker>,
        rival: Arc<Transaction>,
        object: ObjectId,
        outcome: Mutex<Option<ConflictResult>>,
    }

    impl TransactionParticipant for LateRival {
        fn name(&self) -> &str {
            "late-rival"
        }

        fn prepare(&self, _txn: &Transaction) -> Result<Vote> {
            let outcome = self.checker.check_access(
                &self.rival,
                self.object.clone(),
                AccessType::Write,
                &source(),
            )?;
            *self.outcome.lock() = Some(outcome);
            Ok(Vote::ReadOnly)
        }

        fn commit(&self, _txn: &Transaction) -> Result<()> {
            Ok(())
        }

        fn abort(&self, _txn: &Transaction) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn preparing_holder_never_loses() {
        let checker = checker(ConflictMode::FailFast);
        let young = begin(&checker, 1, 200);
        let old = begin(&checker, 2, 100);
        let x = object("x");

        checker.check_access(&young, x.clone(), AccessType::Write, &source()).unwrap();
        let rival = Arc::new(LateRival {
            checker: Arc::clone(&checker),
            rival: Arc::clone(&old),
            object: x.clone(),
            outcome: Mutex::new(None),
        });
        young.join(rival.clone()).unwrap();
        young.commit().unwrap();

        assert_eq!(*rival.outcome.lock(), Some(ConflictResult::SelfAbort));
        assert!(old.is_doomed());
        assert_eq!(young.state(), TransactionState::Committed);
        assert!(!checker.is_tracking(young.id()));
        assert_eq!(checker.tracked_objects(), 0);
    }

    #[test]
    fn abort_is_idempotent_and_releases_objects() {
        let checker = checker(ConflictMode::FailFast);
        let t1 = begin(&checker, 1, 100);
        checker.check_access(&t1, object("a"), AccessType::Write, &source()).unwrap();
        checker.check_access(&t1, object("b"), AccessType::Read, &source()).unwrap();
        assert_eq!(checker.tracked_objects(), 2);

        t1.abort(ThothError::fatal("gave up")).unwrap();
        checker.abort_transaction(&t1);
        assert!(!checker.is_tracking(t1.id()));
        assert_eq!(checker.tracked_objects(), 0);
        assert!(matches!(
            checker.validate(&t1),
            Err(ThothError::InvalidState(_))
        ));
    }

    #[test]
    fn descriptions_attach_before_or_after_access() {
        let checker = checker(ConflictMode::FailFast);
        let t1 = begin(&checker, 1, 100);
        let x = object("x");
        let y = object("y");

        checker.set_description(&t1, x.clone(), Arc::new("early")).unwrap();
        checker.check_access(&t1, x.clone(), AccessType::Read, &source()).unwrap();
        checker.check_access(&t1, y.clone(), AccessType::Read, &source()).unwrap();
        checker.set_description(&t1, y.clone(), Arc::new("late")).unwrap();

        assert_eq!(format!("{:?}", checker.description(t1.id(), &x).unwrap()), "\"early\"");
        assert_eq!(format!("{:?}", checker.description(t1.id(), &y).unwrap()), "\"late\"");
    }

    #[test]
    fn advisory_mode_never_aborts() {
        let checker = checker(ConflictMode::Advisory);
        let t1 = begin(&checker, 1, 100);
        let t2 = begin(&checker, 2, 200);
        let x = object("x");

        for txn in [&t1, &t2] {
            assert_eq!(
                checker.check_access(txn, x.clone(), AccessType::Write, &source()).unwrap(),
                ConflictResult::NoConflict
            );
        }
        assert_eq!(checker.validate(&t2).unwrap(), ConflictResult::NoConflict);
        assert_eq!(checker.validate(&t1).unwrap(), ConflictResult::NoConflict);
    }

    /// Durable participant that commits a read-modify-write of a shared counter
    /// and fails if another writer committed in between.
    struct Increment {
        value: Arc<Mutex<u64>>,
        seen: u64,
    }

    impl TransactionParticipant for Increment {
        fn name(&self) -> &str {
            "increment"
        }

        fn prepare(&self, _txn: &Transaction) -> Result<Vote> {
            Ok(Vote::Prepared)
        }

        fn commit(&self, _txn: &Transaction) -> Result<()> {
            let mut value = self.value.lock();
            assert_eq!(*value, self.seen, "lost update");
            *value += 1;
            Ok(())
        }

        fn abort(&self, _txn: &Transaction) -> Result<()> {
            Ok(())
        }
    }

    /// Durable participant that lets an older rival ask for the object its
    /// transaction holds while the transaction is committing.
    struct RivalDuringCommit {
        checker: Arc<ConflictChecker>,
        rival: Arc<Transaction>,
        object: ObjectId,
        outcome: Mutex<Option<ConflictResult>>,
    }

    impl TransactionParticipant for RivalDuringCommit {
        fn name(&self) -> &str {
            "rival-during-commit"
        }

        fn prepare(&self, _txn: &Transaction) -> Result<Vote> {
            Ok(Vote::Prepared)
        }

        fn commit(&self, _txn: &Transaction) -> Result<()> {
            let outcome = self.checker.check_access(
                &self.rival,
                self.object.clone(),
                AccessType::Write,
                &source(),
            )?;
            *self.outcome.lock() = Some(outcome);
            Ok(())
        }

        fn abort(&self, _txn: &Transaction) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn accesses_outlive_every_durable_commit() {
        let checker = checker(ConflictMode::FailFast);
        let holder = begin(&checker, 2, 200);
        let rival = begin(&checker, 1, 100);
        let x = object("x");
        let value = Arc::new(Mutex::new(0u64));

        checker.check_access(&holder, x.clone(), AccessType::Write, &source()).unwrap();
        let during_commit = Arc::new(RivalDuringCommit {
            checker: Arc::clone(&checker),
            rival: Arc::clone(&rival),
            object: x.clone(),
            outcome: Mutex::new(None),
        });
        holder.join(during_commit.clone()).unwrap();
        holder
            .join(Arc::new(Increment {
                value: Arc::clone(&value),
                seen: *value.lock(),
            }))
            .unwrap();
        holder.commit().unwrap();

        assert_eq!(*during_commit.outcome.lock(), Some(ConflictResult::SelfAbort));
        assert!(rival.is_doomed());
        assert_eq!(*value.lock(), 1);
        assert!(!checker.is_tracking(holder.id()));
        assert_eq!(checker.tracked_objects(), 0);

        let next = begin(&checker, 3, 300);
        assert_eq!(
            checker.check_access(&next, x, AccessType::Write, &source()).unwrap(),
            ConflictResult::NoConflict
        );
    }

    fn concurrent_increments(durable_participants: usize) {
        const THREADS: usize = 4;
        const ROUNDS: u64 = 50;

        let checker = checker(ConflictMode::FailFast);
        let clock = Arc::new(AtomicU64::new(1));
        let counters: Arc<Vec<Arc<Mutex<u64>>>> = Arc::new(
            (0..durable_participants)
                .map(|_| Arc::new(Mutex::new(0u64)))
                .collect(),
        );
        let barrier = Arc::new(Barrier::new(THREADS));
        let x = object("x");

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let checker = Arc::clone(&checker);
                let clock = Arc::clone(&clock);
                let counters = Arc::clone(&counters);
                let barrier = Arc::clone(&barrier);
                let x = x.clone();
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..ROUNDS {
                        loop {
                            let tick = clock.fetch_add(1, Ordering::SeqCst);
                            let txn = begin(&checker, tick, tick);
                            let outcome = checker
                                .check_access(&txn, x.clone(), AccessType::Write, &source())
                                .unwrap();
                            if outcome == ConflictResult::SelfAbort {
                                let _ = txn.abort(ThothError::fatal("conflict"));
                                continue;
                            }
                            let mut joined = Ok(());
                            for counter in counters.iter() {
                                let seen = *counter.lock();
                                thread::yield_now();
                                joined = joined.and_then(|_| {
                                    txn.join(Arc::new(Increment {
                                        value: Arc::clone(counter),
                                        seen,
                                    }))
                                });
                            }
                            match joined.and_then(|_| txn.commit()) {
                                Ok(()) => break,
                                Err(e) => {
                                    let _ = txn.abort(e);
                                }
                            }
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        for counter in counters.iter() {
            assert_eq!(*counter.lock(), THREADS as u64 * ROUNDS);
        }
        assert_eq!(checker.tracked_transactions(), 0);
        assert_eq!(checker.tracked_objects(), 0);
    }

    #[test]
    fn concurrent_writers_never_lose_updates() {
        concurrent_increments(1);
    }

    #[test]
    fn concurrent_writers_with_two_phase_commit_never_lose_updates() {
        concurrent_increments(3);
    }
}
