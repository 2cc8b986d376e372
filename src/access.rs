//! Reporting object accesses to the conflict checker.
//!
//! Code that touches shared objects reports each access through an
//! [`AccessReporter`] before it resolves the object, so conflicts surface
//! before any work is spent on the access.

use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

use log::trace;

use crate::conflict::detection::{ConflictChecker, ConflictResult};
use crate::conflict::resolution::{ConflictMode, ConflictResolver, OldestWins};
use crate::context;
use crate::errors::{Result, ThothError};
use crate::transaction::Transaction;

/// The kind of access requested on an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AccessType {
    Read,
    Write,
}

/// Diagnostic annotation attached to an access.
pub type Description = Arc<dyn fmt::Debug + Send + Sync>;

/// A key type usable as an object identifier.
///
/// Implemented for every `Hash + Eq + Debug` type, so keys of different types
/// can share one checker without colliding.
pub trait ObjectKey: Any + fmt::Debug + Send + Sync {
    fn key_eq(&self, other: &dyn ObjectKey) -> bool;
    fn key_hash(&self, state: &mut dyn Hasher);
    fn as_any(&self) -> &dyn Any;
}

impl<T> ObjectKey for T
where
    T: Any + Hash + Eq + fmt::Debug + Send + Sync,
{
    fn key_eq(&self, other: &dyn ObjectKey) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .is_some_and(|other| other == self)
    }

    fn key_hash(&self, mut state: &mut dyn Hasher) {
        TypeId::of::<T>().hash(&mut state);
        self.hash(&mut state);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Identifies a shared object: the reporting source plus its key.
#[derive(Clone)]
pub struct ObjectId {
    source: Arc<str>,
    key: Arc<dyn ObjectKey>,
}

impl ObjectId {
    pub fn new<K: ObjectKey>(source: impl AsRef<str>, key: K) -> Self {
        Self {
            source: Arc::from(source.as_ref()),
            key: Arc::new(key),
        }
    }

    fn with_source<K: ObjectKey>(source: &Arc<str>, key: K) -> Self {
        Self {
            source: Arc::clone(source),
            key: Arc::new(key),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// The key, if it has type `K`.
    pub fn key<K: ObjectKey>(&self) -> Option<&K> {
        self.key.as_any().downcast_ref::<K>()
    }
}

impl PartialEq for ObjectId {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source && self.key.key_eq(other.key.as_ref())
    }
}

impl Eq for ObjectId {}

impl Hash for ObjectId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.source.hash(state);
        self.key.key_hash(state);
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:?}", self.source, self.key)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self)
    }
}

/// Reports accesses for objects of one source, keyed by `K`.
pub struct AccessReporter<K> {
    source: Arc<str>,
    checker: Arc<ConflictChecker>,
    _key: PhantomData<fn(K)>,
}

impl<K: ObjectKey> AccessReporter<K> {
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Reports an access in the current transaction.
    ///
    /// Must run inside a transaction. When the access loses a conflict the
    /// transaction is doomed and a [`ThothError::TransactionConflict`] is
    /// returned; the caller should stop working and propagate it.
    pub fn report_access(&self, key: K, access: AccessType) -> Result<()> {
        let txn = context::current_transaction()?;
        self.report(&txn, key, access, None)
    }

    /// Like [`report_access`](Self::report_access), attaching a description.
    pub fn report_access_with_description(
        &self,
        key: K,
        access: AccessType,
        description: Description,
    ) -> Result<()> {
        let txn = context::current_transaction()?;
        self.report(&txn, key, access, Some(description))
    }

    /// Reports an access for an explicitly supplied transaction.
    pub fn report_access_in(&self, txn: &Arc<Transaction>, key: K, access: AccessType) -> Result<()> {
        txn.check_active()?;
        self.report(txn, key, access, None)
    }

    /// Attaches a description to an object, before or after reporting it.
    ///
    /// Descriptions never change the outcome of a conflict check.
    pub fn set_description(&self, key: K, description: Description) -> Result<()> {
        let txn = context::current_transaction()?;
        let obj = ObjectId::with_source(&self.source, key);
        self.checker.set_description(&txn, obj, description)
    }

    fn report(
        &self,
        txn: &Arc<Transaction>,
        key: K,
        access: AccessType,
        description: Option<Description>,
    ) -> Result<()> {
        let obj = ObjectId::with_source(&self.source, key);
        trace!("Transaction {} reports {:?} on {}", txn.id(), access, obj);
        match self
            .checker
            .check_access(txn, obj.clone(), access, &self.source)?
        {
            ConflictResult::NoConflict | ConflictResult::OtherAbort(_) => {
                if let Some(description) = description {
                    self.checker.set_description(txn, obj, description)?;
                }
                Ok(())
            }
            ConflictResult::SelfAbort => Err(ThothError::TransactionConflict {
                txn: txn.id().clone(),
                reason: format!("{:?} access to {} lost a conflict", access, obj),
            }),
        }
    }
}

impl<K> Clone for AccessReporter<K> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            checker: Arc::clone(&self.checker),
            _key: PhantomData,
        }
    }
}

/// Owns the conflict checker and hands out reporters to access sources.
pub struct AccessCoordinator {
    checker: Arc<ConflictChecker>,
    resolver: Arc<dyn ConflictResolver>,
}

impl AccessCoordinator {
    pub fn new(mode: ConflictMode) -> Self {
        Self::with_resolver(mode, Arc::new(OldestWins))
    }

    pub fn with_resolver(mode: ConflictMode, resolver: Arc<dyn ConflictResolver>) -> Self {
        Self {
            checker: Arc::new(ConflictChecker::new(mode)),
            resolver,
        }
    }

    /// Returns a reporter whose accesses are attributed to `source`.
    pub fn register_access_source<K: ObjectKey>(&self, source: impl AsRef<str>) -> AccessReporter<K> {
        AccessReporter {
            source: Arc::from(source.as_ref()),
            checker: Arc::clone(&self.checker),
            _key: PhantomData,
        }
    }

    pub fn checker(&self) -> &Arc<ConflictChecker> {
        &self.checker
    }

    /// Starts tracking a freshly created transaction.
    pub(crate) fn started(&self, txn: &Arc<Transaction>) -> Result<()> {
        self.checker.started(txn, Arc::clone(&self.resolver))
    }
}

impl Default for AccessCoordinator {
    fn default() -> Self {
        Self::new(ConflictMode::default())
    }
}
