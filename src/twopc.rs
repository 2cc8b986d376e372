use crate::errors::Result;
use crate::transaction::Transaction;

/// How a participant takes part in commit.
///
/// Non-durable participants hold no state that must survive a crash; they are
/// always prepared before durable ones so that a single durable participant
/// can be committed in one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantKind {
    Durable,
    NonDurable,
}

/// A participant's answer to the prepare phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    /// The participant has changes and must be told to commit.
    Prepared,
    /// The participant made no changes; it will not be committed.
    ReadOnly,
}

/// A collaborator that must agree before a transaction commits.
///
/// Participants are joined to a [`Transaction`] while it is active. When the
/// task body finishes, every participant is asked to [`prepare`]; a prepare
/// failure is reported by returning an error and makes the transaction abort.
/// Implementations must tolerate [`abort`] being called after they already
/// aborted on their own.
///
/// Implementations must be `Send` and `Sync` because transactions can be
/// aborted from a different worker than the one running them.
///
/// [`prepare`]: TransactionParticipant::prepare
/// [`abort`]: TransactionParticipant::abort
pub trait TransactionParticipant: Send + Sync {
    /// A name used in logs and errors.
    fn name(&self) -> &str;

    fn kind(&self) -> ParticipantKind {
        ParticipantKind::Durable
    }

    /// Phase 1: validate and stage the participant's changes.
    fn prepare(&self, txn: &Transaction) -> Result<Vote>;

    /// Phase 2: make the prepared changes visible.
    fn commit(&self, txn: &Transaction) -> Result<()>;

    /// Prepares and commits in a single step.
    ///
    /// Used when this is the only durable participant left to prepare.
    fn prepare_and_commit(&self, txn: &Transaction) -> Result<()> {
        match self.prepare(txn)? {
            Vote::Prepared => self.commit(txn),
            Vote::ReadOnly => Ok(()),
        }
    }

    /// Discards any changes made on behalf of the transaction.
    fn abort(&self, txn: &Transaction) -> Result<()>;
}
