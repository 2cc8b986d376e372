use std::fmt;
use std::sync::Arc;

use log::{debug, error, trace, warn};
use parking_lot::Mutex;

use crate::errors::{Result, ThothError};
use crate::twopc::{ParticipantKind, TransactionParticipant, Vote};

/// Opaque, globally unique transaction identifier.
///
/// Identifiers compare lexicographically by their bytes, which for ids issued
/// by the coordinator is the order in which they were created.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(Arc<[u8]>);

impl TransactionId {
    pub(crate) fn from_counter(value: u64) -> Self {
        TransactionId(Arc::from(value.to_be_bytes().as_slice()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionId({})", self)
    }
}

/// Lifecycle of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Preparing,
    Committed,
    Aborted,
}

struct TxnInner {
    state: TransactionState,
    participants: Vec<Arc<dyn TransactionParticipant>>,
    abort_cause: Option<ThothError>,
    /// Set when another transaction won a conflict against this one.
    doomed: Option<ThothError>,
}

/// The isolation context of a single task attempt.
///
/// A transaction is created right before task code runs and is finished by
/// exactly one commit or abort. Retrying a task creates a new transaction.
pub struct Transaction {
    id: TransactionId,
    creation_time: u64,
    inner: Mutex<TxnInner>,
}

impl Transaction {
    pub(crate) fn new(id: TransactionId, creation_time: u64) -> Self {
        trace!("Created transaction {} at {}", id, creation_time);
        Self {
            id,
            creation_time,
            inner: Mutex::new(TxnInner {
                state: TransactionState::Active,
                participants: Vec::new(),
                abort_cause: None,
                doomed: None,
            }),
        }
    }

    pub fn id(&self) -> &TransactionId {
        &self.id
    }

    /// Wall-clock creation time in milliseconds.
    pub fn creation_time(&self) -> u64 {
        self.creation_time
    }

    pub fn state(&self) -> TransactionState {
        self.inner.lock().state
    }

    /// Returns `true` while the transaction may still run task code.
    pub fn is_active(&self) -> bool {
        let inner = self.inner.lock();
        inner.state == TransactionState::Active && inner.doomed.is_none()
    }

    /// Returns `true` if a conflict decided this transaction must abort.
    pub fn is_doomed(&self) -> bool {
        self.inner.lock().doomed.is_some()
    }

    /// Returns `true` while accesses recorded for this transaction still count
    /// against other transactions.
    ///
    /// A committed transaction keeps its accesses until the conflict checker
    /// is committed and drops them.
    pub(crate) fn holds_accesses(&self) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            TransactionState::Active => inner.doomed.is_none(),
            TransactionState::Preparing | TransactionState::Committed => true,
            TransactionState::Aborted => false,
        }
    }

    /// The cause passed to [`Transaction::abort`], once aborted.
    pub fn abort_cause(&self) -> Option<ThothError> {
        self.inner.lock().abort_cause.clone()
    }

    /// Fails unless the transaction can keep running task code.
    pub fn check_active(&self) -> Result<()> {
        let inner = self.inner.lock();
        if let Some(cause) = &inner.doomed {
            return Err(cause.clone());
        }
        if inner.state != TransactionState::Active {
            return Err(ThothError::TransactionNotActive(self.id.clone()));
        }
        Ok(())
    }

    /// Adds a participant. Joining the same participant twice has no effect.
    pub fn join(&self, participant: Arc<dyn TransactionParticipant>) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(cause) = &inner.doomed {
            return Err(cause.clone());
        }
        if inner.state != TransactionState::Active {
            return Err(ThothError::TransactionNotActive(self.id.clone()));
        }
        let already_joined = inner
            .participants
            .iter()
            .any(|p| same_participant(p, &participant));
        if !already_joined {
            debug!("Participant {} joined {}", participant.name(), self.id);
            inner.participants.push(participant);
        }
        Ok(())
    }

    pub fn participant_count(&self) -> usize {
        self.inner.lock().participants.len()
    }

    /// Aborts the transaction and notifies every participant.
    ///
    /// Aborting an already aborted transaction fails with
    /// [`ThothError::TransactionNotActive`]; aborting a committed one is a
    /// state violation.
    pub fn abort(&self, cause: ThothError) -> Result<()> {
        let participants = {
            let mut inner = self.inner.lock();
            match inner.state {
                TransactionState::Active | TransactionState::Preparing => {}
                TransactionState::Aborted => {
                    return Err(ThothError::TransactionNotActive(self.id.clone()));
                }
                TransactionState::Committed => {
                    return Err(ThothError::InvalidState(format!(
                        "transaction {} is already committed",
                        self.id
                    )));
                }
            }
            debug!("Aborting transaction {}: {}", self.id, cause);
            inner.state = TransactionState::Aborted;
            inner.abort_cause = Some(cause);
            inner.participants.clone()
        };

        for participant in participants {
            if let Err(e) = participant.abort(self) {
                warn!(
                    "Participant {} failed to abort {}: {}",
                    participant.name(),
                    self.id,
                    e
                );
            }
        }
        Ok(())
    }

    /// Marks the transaction as the loser of a conflict.
    ///
    /// Returns `false` if the transaction is already preparing or committed,
    /// in which case it can no longer lose.
    pub(crate) fn try_doom(&self, cause: ThothError) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            TransactionState::Active => {
                if inner.doomed.is_none() {
                    debug!("Transaction {} doomed: {}", self.id, cause);
                    inner.doomed = Some(cause);
                }
                true
            }
            TransactionState::Aborted => true,
            TransactionState::Preparing | TransactionState::Committed => false,
        }
    }

    /// Runs the two-phase commit protocol over the joined participants.
    ///
    /// On error the transaction is left in the preparing state and the caller
    /// is expected to abort it.
    pub(crate) fn commit(&self) -> Result<()> {
        let participants = {
            let mut inner = self.inner.lock();
            if let Some(cause) = &inner.doomed {
                return Err(cause.clone());
            }
            if inner.state != TransactionState::Active {
                return Err(ThothError::TransactionNotActive(self.id.clone()));
            }
            inner.state = TransactionState::Preparing;
            inner.participants.clone()
        };

        let (non_durable, mut durable): (Vec<_>, Vec<_>) = participants
            .into_iter()
            .partition(|p| p.kind() == ParticipantKind::NonDurable);
        let last_agent = if durable.len() == 1 { durable.pop() } else { None };

        let mut prepared = Vec::new();
        for participant in non_durable.iter().chain(durable.iter()) {
            match participant.prepare(self)? {
                Vote::Prepared => prepared.push(Arc::clone(participant)),
                Vote::ReadOnly => {
                    trace!("Participant {} is read-only in {}", participant.name(), self.id)
                }
            }
        }
        if let Some(participant) = last_agent {
            participant.prepare_and_commit(self)?;
        }

        self.inner.lock().state = TransactionState::Committed;
        debug!("Committed transaction {}", self.id);

        // Durable changes land before non-durable participants let go.
        let (release, apply): (Vec<_>, Vec<_>) = prepared
            .into_iter()
            .partition(|p| p.kind() == ParticipantKind::NonDurable);
        for participant in apply.into_iter().chain(release) {
            if let Err(e) = participant.commit(self) {
                error!(
                    "Participant {} failed to commit prepared transaction {}: {}",
                    participant.name(),
                    self.id,
                    e
                );
            }
        }
        Ok(())
    }
}

fn same_participant(a: &Arc<dyn TransactionParticipant>, b: &Arc<dyn TransactionParticipant>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Transaction {}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("creation_time", &self.creation_time)
            .field("state", &self.state())
            .finish()
    }
}
