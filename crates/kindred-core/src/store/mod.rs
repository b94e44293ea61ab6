//! Module: store
//! Responsibility: the collaborator interface to the underlying key-value
//! store. The engine consumes this trait; network clients and test doubles
//! implement it.
//! Does not own: retry policy, rollback of in-memory state, or batching
//! decisions (txn/flush).
//!
//! The store is injected into the engine constructor; there is no global
//! "current store" state. Call interception for tests is an explicit
//! decorator implementing the same trait.

use crate::{entity::Entity, error::PersistError, key::Key};
use std::collections::BTreeMap;
use thiserror::Error as ThisError;

///
/// StoreFault
///
/// The fault signals a store implementation may raise. The engine translates
/// these into the public error taxonomy; `ConcurrentModification` is the only
/// signal with transaction-rollback semantics.
///

#[remain::sorted]
#[derive(Clone, Debug, Eq, PartialEq, ThisError)]
pub enum StoreFault {
    #[error("concurrent modification{}", key.as_deref().map(|k| format!(" on {k}")).unwrap_or_default())]
    ConcurrentModification { key: Option<String> },

    #[error("not found: {key}")]
    NotFound { key: String },

    #[error("store unavailable: {message}")]
    Unavailable { message: String },
}

impl StoreFault {
    /// Translate a fault raised by `operation` into the public taxonomy.
    /// Collision context (`kind`/`key`/`completed`) is attached by the
    /// concurrency guard, which knows the flush position.
    pub(crate) fn into_persist(self, operation: &str) -> PersistError {
        match self {
            Self::NotFound { key } => PersistError::NotFound { key },
            Self::ConcurrentModification { key } => PersistError::ConcurrentModification {
                kind: String::new(),
                key: key.unwrap_or_default(),
                completed: 0,
            },
            Self::Unavailable { message } => PersistError::Store {
                operation: operation.to_string(),
                message,
            },
        }
    }
}

///
/// TxnHandle
///
/// Opaque transaction token minted by the store. The engine never inspects
/// it; it only threads the handle through reads/writes and hands it back on
/// commit/rollback.
///

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct TxnHandle(pub u64);

///
/// IdRange
///
/// Inclusive range of allocated numeric ids. Every allocation is fresh;
/// ranges from one sequence never overlap.
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IdRange {
    pub start: i64,
    pub end: i64,
}

impl IdRange {
    #[must_use]
    pub const fn len(&self) -> u64 {
        (self.end - self.start + 1) as u64
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

///
/// Store
///
/// Blocking store-client surface. Batched forms share the underlying call's
/// single-entity-group constraint when a transaction handle is supplied;
/// enforcing that constraint *before* issuing the call is the engine's job.
///

pub trait Store {
    fn get(&self, txn: Option<&TxnHandle>, key: &Key) -> Result<Entity, StoreFault>;

    /// Batched lookup; missing keys are simply absent from the result.
    fn get_many(
        &self,
        txn: Option<&TxnHandle>,
        keys: &[Key],
    ) -> Result<BTreeMap<Key, Entity>, StoreFault>;

    fn put(&self, txn: Option<&TxnHandle>, entity: Entity) -> Result<Key, StoreFault>;

    fn put_many(
        &self,
        txn: Option<&TxnHandle>,
        entities: Vec<Entity>,
    ) -> Result<Vec<Key>, StoreFault>;

    fn delete(&self, txn: Option<&TxnHandle>, key: &Key) -> Result<(), StoreFault>;

    fn delete_many(&self, txn: Option<&TxnHandle>, keys: &[Key]) -> Result<(), StoreFault>;

    fn begin_transaction(&self) -> Result<TxnHandle, StoreFault>;

    fn commit(&self, txn: TxnHandle) -> Result<(), StoreFault>;

    fn rollback(&self, txn: TxnHandle) -> Result<(), StoreFault>;

    /// Reserve `size` fresh ids in the named sequence's id space.
    fn allocate_id_range(&self, sequence: &str, size: u64) -> Result<IdRange, StoreFault>;
}
