use serde::{Deserialize, Serialize};

use crate::transaction::Transaction;

/// Which side of a conflict has to abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Loser {
    /// The transaction that reported the access.
    Requester,
    /// The transaction already holding the object.
    Holder,
}

/// Decides which of two conflicting transactions aborts.
///
/// Resolution must be deterministic: given the same pair of transactions it
/// always picks the same loser, whichever of them is the requester.
pub trait ConflictResolver: Send + Sync {
    fn resolve(&self, requester: &Transaction, holder: &Transaction) -> Loser;
}

/// The younger transaction yields to the older one.
///
/// Transactions are ordered by creation time and then by id, so the order is
/// total and an older transaction never waits for or loses to a younger one.
#[derive(Debug, Clone, Copy, Default)]
pub struct OldestWins;

impl ConflictResolver for OldestWins {
    fn resolve(&self, requester: &Transaction, holder: &Transaction) -> Loser {
        let requester_age = (requester.creation_time(), requester.id());
        let holder_age = (holder.creation_time(), holder.id());
        if requester_age > holder_age {
            Loser::Requester
        } else {
            Loser::Holder
        }
    }
}

/// How the checker reacts to a detected conflict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictMode {
    /// Abort the losing transaction immediately.
    #[default]
    FailFast,
    /// Only log conflicts. Kept for deployments that predate fail-fast
    /// checking; write exclusion is not enforced in this mode.
    Advisory,
}
