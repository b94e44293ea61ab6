//! Shared test-only collaborators: an in-memory store, explicit decorator
//! stores for call counting and fault injection, and fixture descriptors.

use crate::{
    entity::Entity,
    error::PersistError,
    key::{Key, KindName},
    meta::{
        ContainerKind, EmbeddedDescriptor, EntityDescriptor, FieldDescriptor, KeyStrategy,
        ScalarKind,
        relationship::{CascadePolicy, OrderingPolicy, RelationshipDescriptor},
    },
    session::Engine,
    store::{IdRange, Store, StoreFault, TxnHandle},
};
use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    rc::Rc,
};

pub(crate) fn kind(name: &str) -> KindName {
    KindName::try_from_str(name).expect("valid test kind")
}

///
/// MemoryStore
///
/// Transactional in-memory store double. Writes inside a transaction buffer
/// until commit; reads always see the committed view. Cheap to clone: all
/// handles share one backing map, so tests can keep one for inspection
/// after moving another into the engine.
///

#[derive(Clone, Debug, Default)]
pub(crate) struct MemoryStore {
    inner: Rc<RefCell<MemoryInner>>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    entities: BTreeMap<Key, Entity>,
    sequences: BTreeMap<String, i64>,
    txns: BTreeMap<u64, TxnBuffer>,
    next_txn: u64,
}

#[derive(Debug, Default)]
struct TxnBuffer {
    puts: Vec<Entity>,
    deletes: Vec<Key>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity(&self, key: &Key) -> Option<Entity> {
        self.inner.borrow().entities.get(key).cloned()
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.inner.borrow().entities.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().entities.len()
    }

}

// Buffered vs direct write dispatch for the memory store.
impl MemoryInner {
    fn txn_buffer(&mut self, handle: &TxnHandle) -> Result<&mut TxnBuffer, StoreFault> {
        self.txns
            .get_mut(&handle.0)
            .ok_or_else(|| StoreFault::Unavailable {
                message: format!("unknown transaction {}", handle.0),
            })
    }
}

impl Store for MemoryStore {
    fn get(&self, _txn: Option<&TxnHandle>, key: &Key) -> Result<Entity, StoreFault> {
        self.inner
            .borrow()
            .entities
            .get(key)
            .cloned()
            .ok_or_else(|| StoreFault::NotFound {
                key: key.to_string(),
            })
    }

    fn get_many(
        &self,
        _txn: Option<&TxnHandle>,
        keys: &[Key],
    ) -> Result<BTreeMap<Key, Entity>, StoreFault> {
        let inner = self.inner.borrow();
        Ok(keys
            .iter()
            .filter_map(|k| inner.entities.get(k).map(|e| (k.clone(), e.clone())))
            .collect())
    }

    fn put(&self, txn: Option<&TxnHandle>, entity: Entity) -> Result<Key, StoreFault> {
        let key = entity.key().clone();
        let mut inner = self.inner.borrow_mut();
        match txn {
            Some(handle) => inner.txn_buffer(handle)?.puts.push(entity),
            None => {
                inner.entities.insert(key.clone(), entity);
            }
        }
        Ok(key)
    }

    fn put_many(
        &self,
        txn: Option<&TxnHandle>,
        entities: Vec<Entity>,
    ) -> Result<Vec<Key>, StoreFault> {
        let keys: Vec<Key> = entities.iter().map(|e| e.key().clone()).collect();
        let mut inner = self.inner.borrow_mut();
        match txn {
            Some(handle) => inner.txn_buffer(handle)?.puts.extend(entities),
            None => {
                for entity in entities {
                    inner.entities.insert(entity.key().clone(), entity);
                }
            }
        }
        Ok(keys)
    }

    fn delete(&self, txn: Option<&TxnHandle>, key: &Key) -> Result<(), StoreFault> {
        let mut inner = self.inner.borrow_mut();
        match txn {
            Some(handle) => inner.txn_buffer(handle)?.deletes.push(key.clone()),
            None => {
                inner.entities.remove(key);
            }
        }
        Ok(())
    }

    fn delete_many(&self, txn: Option<&TxnHandle>, keys: &[Key]) -> Result<(), StoreFault> {
        let mut inner = self.inner.borrow_mut();
        match txn {
            Some(handle) => inner
                .txn_buffer(handle)?
                .deletes
                .extend(keys.iter().cloned()),
            None => {
                for key in keys {
                    inner.entities.remove(key);
                }
            }
        }
        Ok(())
    }

    fn begin_transaction(&self) -> Result<TxnHandle, StoreFault> {
        let mut inner = self.inner.borrow_mut();
        inner.next_txn += 1;
        let handle = inner.next_txn;
        inner.txns.insert(handle, TxnBuffer::default());
        Ok(TxnHandle(handle))
    }

    fn commit(&self, txn: TxnHandle) -> Result<(), StoreFault> {
        let mut inner = self.inner.borrow_mut();
        let buffer = inner
            .txns
            .remove(&txn.0)
            .ok_or_else(|| StoreFault::Unavailable {
                message: format!("unknown transaction {}", txn.0),
            })?;
        for entity in buffer.puts {
            inner.entities.insert(entity.key().clone(), entity);
        }
        for key in buffer.deletes {
            inner.entities.remove(&key);
        }
        Ok(())
    }

    fn rollback(&self, txn: TxnHandle) -> Result<(), StoreFault> {
        self.inner.borrow_mut().txns.remove(&txn.0);
        Ok(())
    }

    fn allocate_id_range(&self, sequence: &str, size: u64) -> Result<IdRange, StoreFault> {
        let mut inner = self.inner.borrow_mut();
        let next = inner.sequences.entry(sequence.to_string()).or_insert(1);
        let start = *next;
        *next += size as i64;
        Ok(IdRange {
            start,
            end: start + size as i64 - 1,
        })
    }
}

///
/// CallCounts
///

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct CallCounts {
    pub gets: usize,
    pub puts: usize,
    pub put_manys: usize,
    pub deletes: usize,
    pub delete_manys: usize,
    pub allocates: usize,
    pub begins: usize,
    pub commits: usize,
    pub rollbacks: usize,
}

///
/// CountingStore
///
/// Explicit decorator over any store, counting calls per operation.
///

#[derive(Clone, Debug)]
pub(crate) struct CountingStore<S> {
    delegate: S,
    counts: Rc<Cell<CallCounts>>,
}

impl<S> CountingStore<S> {
    pub fn new(delegate: S) -> Self {
        Self {
            delegate,
            counts: Rc::new(Cell::new(CallCounts::default())),
        }
    }

    pub fn counts_handle(&self) -> Rc<Cell<CallCounts>> {
        Rc::clone(&self.counts)
    }

    fn bump(&self, update: impl FnOnce(&mut CallCounts)) {
        let mut counts = self.counts.get();
        update(&mut counts);
        self.counts.set(counts);
    }
}

impl<S: Store> Store for CountingStore<S> {
    fn get(&self, txn: Option<&TxnHandle>, key: &Key) -> Result<Entity, StoreFault> {
        self.bump(|c| c.gets += 1);
        self.delegate.get(txn, key)
    }

    fn get_many(
        &self,
        txn: Option<&TxnHandle>,
        keys: &[Key],
    ) -> Result<BTreeMap<Key, Entity>, StoreFault> {
        self.bump(|c| c.gets += 1);
        self.delegate.get_many(txn, keys)
    }

    fn put(&self, txn: Option<&TxnHandle>, entity: Entity) -> Result<Key, StoreFault> {
        self.bump(|c| c.puts += 1);
        self.delegate.put(txn, entity)
    }

    fn put_many(
        &self,
        txn: Option<&TxnHandle>,
        entities: Vec<Entity>,
    ) -> Result<Vec<Key>, StoreFault> {
        self.bump(|c| c.put_manys += 1);
        self.delegate.put_many(txn, entities)
    }

    fn delete(&self, txn: Option<&TxnHandle>, key: &Key) -> Result<(), StoreFault> {
        self.bump(|c| c.deletes += 1);
        self.delegate.delete(txn, key)
    }

    fn delete_many(&self, txn: Option<&TxnHandle>, keys: &[Key]) -> Result<(), StoreFault> {
        self.bump(|c| c.delete_manys += 1);
        self.delegate.delete_many(txn, keys)
    }

    fn begin_transaction(&self) -> Result<TxnHandle, StoreFault> {
        self.bump(|c| c.begins += 1);
        self.delegate.begin_transaction()
    }

    fn commit(&self, txn: TxnHandle) -> Result<(), StoreFault> {
        self.bump(|c| c.commits += 1);
        self.delegate.commit(txn)
    }

    fn rollback(&self, txn: TxnHandle) -> Result<(), StoreFault> {
        self.bump(|c| c.rollbacks += 1);
        self.delegate.rollback(txn)
    }

    fn allocate_id_range(&self, sequence: &str, size: u64) -> Result<IdRange, StoreFault> {
        self.bump(|c| c.allocates += 1);
        self.delegate.allocate_id_range(sequence, size)
    }
}

///
/// CollidingStore
///
/// Decorator that raises a concurrent-modification fault on the Nth
/// write-family call (1-based), or on commit.
///

#[derive(Clone, Debug)]
pub(crate) struct CollidingStore<S> {
    delegate: S,
    write_calls: Rc<Cell<usize>>,
    fail_on_write_call: Option<usize>,
    fail_on_commit: bool,
}

impl<S> CollidingStore<S> {
    pub fn failing_write(delegate: S, call: usize) -> Self {
        Self {
            delegate,
            write_calls: Rc::new(Cell::new(0)),
            fail_on_write_call: Some(call),
            fail_on_commit: false,
        }
    }

    pub fn failing_commit(delegate: S) -> Self {
        Self {
            delegate,
            write_calls: Rc::new(Cell::new(0)),
            fail_on_write_call: None,
            fail_on_commit: true,
        }
    }

    fn check_write(&self) -> Result<(), StoreFault> {
        let call = self.write_calls.get() + 1;
        self.write_calls.set(call);
        if self.fail_on_write_call == Some(call) {
            return Err(StoreFault::ConcurrentModification { key: None });
        }
        Ok(())
    }
}

impl<S: Store> Store for CollidingStore<S> {
    fn get(&self, txn: Option<&TxnHandle>, key: &Key) -> Result<Entity, StoreFault> {
        self.delegate.get(txn, key)
    }

    fn get_many(
        &self,
        txn: Option<&TxnHandle>,
        keys: &[Key],
    ) -> Result<BTreeMap<Key, Entity>, StoreFault> {
        self.delegate.get_many(txn, keys)
    }

    fn put(&self, txn: Option<&TxnHandle>, entity: Entity) -> Result<Key, StoreFault> {
        self.check_write()?;
        self.delegate.put(txn, entity)
    }

    fn put_many(
        &self,
        txn: Option<&TxnHandle>,
        entities: Vec<Entity>,
    ) -> Result<Vec<Key>, StoreFault> {
        self.check_write()?;
        self.delegate.put_many(txn, entities)
    }

    fn delete(&self, txn: Option<&TxnHandle>, key: &Key) -> Result<(), StoreFault> {
        self.check_write()?;
        self.delegate.delete(txn, key)
    }

    fn delete_many(&self, txn: Option<&TxnHandle>, keys: &[Key]) -> Result<(), StoreFault> {
        self.check_write()?;
        self.delegate.delete_many(txn, keys)
    }

    fn begin_transaction(&self) -> Result<TxnHandle, StoreFault> {
        self.delegate.begin_transaction()
    }

    fn commit(&self, txn: TxnHandle) -> Result<(), StoreFault> {
        if self.fail_on_commit {
            let _ = self.delegate.rollback(txn);
            return Err(StoreFault::ConcurrentModification { key: None });
        }
        self.delegate.commit(txn)
    }

    fn rollback(&self, txn: TxnHandle) -> Result<(), StoreFault> {
        self.delegate.rollback(txn)
    }

    fn allocate_id_range(&self, sequence: &str, size: u64) -> Result<IdRange, StoreFault> {
        self.delegate.allocate_id_range(sequence, size)
    }
}

///
/// Fixture descriptors
///

/// `Album` root: auto id, title, one-to-many `tracks` with the given
/// ordering policy and cascade-all.
pub(crate) fn album_descriptor(ordering: OrderingPolicy) -> EntityDescriptor {
    let mut tracks = RelationshipDescriptor::one_to_many(kind("Track"))
        .bidirectional("album")
        .cascade(CascadePolicy::All);
    if let OrderingPolicy::Explicit { field } = ordering {
        tracks = tracks.ordered_by(field);
    }

    EntityDescriptor::new(kind("Album"), KeyStrategy::AutoId)
        .with_field(FieldDescriptor::key_id("id"))
        .with_field(FieldDescriptor::scalar("title", ScalarKind::Text))
        .with_field(FieldDescriptor::relationship("tracks", tracks))
}

/// `Album` variant whose tracks soft-detach on removal (no cascade delete).
pub(crate) fn album_descriptor_soft_detach() -> EntityDescriptor {
    EntityDescriptor::new(kind("Album"), KeyStrategy::AutoId)
        .with_field(FieldDescriptor::key_id("id"))
        .with_field(FieldDescriptor::scalar("title", ScalarKind::Text))
        .with_field(FieldDescriptor::relationship(
            "tracks",
            RelationshipDescriptor::one_to_many(kind("Track"))
                .bidirectional("album")
                .cascade(CascadePolicy::Persist),
        ))
}

/// `Track` element: auto id, title, explicit `position` index field, and an
/// unowned back reference to its album.
pub(crate) fn track_descriptor() -> EntityDescriptor {
    EntityDescriptor::new(kind("Track"), KeyStrategy::AutoId)
        .with_field(FieldDescriptor::key_id("id"))
        .with_field(FieldDescriptor::scalar("title", ScalarKind::Text))
        .with_field(FieldDescriptor::scalar("position", ScalarKind::Int32))
        .with_field(FieldDescriptor::relationship(
            "album",
            RelationshipDescriptor::one_to_one(kind("Album"))
                .cascade(CascadePolicy::None)
                .unowned(),
        ))
}

/// `Gadget`: one field of every supported value shape, for round trips.
pub(crate) fn gadget_descriptor() -> EntityDescriptor {
    EntityDescriptor::new(kind("Gadget"), KeyStrategy::AutoId)
        .with_field(FieldDescriptor::key_id("id"))
        .with_field(FieldDescriptor::scalar("flag", ScalarKind::Bool))
        .with_field(FieldDescriptor::scalar("tiny", ScalarKind::Int8))
        .with_field(FieldDescriptor::scalar("small", ScalarKind::Int16))
        .with_field(FieldDescriptor::scalar("medium", ScalarKind::Int32))
        .with_field(FieldDescriptor::scalar("large", ScalarKind::Int64))
        .with_field(FieldDescriptor::scalar("ratio", ScalarKind::Float))
        .with_field(FieldDescriptor::scalar("label", ScalarKind::Text))
        .with_field(FieldDescriptor::scalar("seen_at", ScalarKind::Timestamp))
        .with_field(FieldDescriptor::scalar(
            "status",
            ScalarKind::Enum(vec!["ACTIVE".into(), "RETIRED".into()]),
        ))
        .with_field(FieldDescriptor::short_blob("checksum", 16))
        .with_field(FieldDescriptor::blob("payload"))
        .with_field(FieldDescriptor::collection(
            "scores",
            ScalarKind::Int64,
            ContainerKind::List,
        ))
        .with_field(FieldDescriptor::collection(
            "tags",
            ScalarKind::Text,
            ContainerKind::Set,
        ))
}

/// `Person` with a flattened embedded `address` record.
pub(crate) fn person_descriptor() -> EntityDescriptor {
    let address = EmbeddedDescriptor::new(vec![
        FieldDescriptor::scalar("street", ScalarKind::Text),
        FieldDescriptor::scalar("city", ScalarKind::Text),
        FieldDescriptor::scalar("zip", ScalarKind::Int32),
    ]);

    EntityDescriptor::new(kind("Person"), KeyStrategy::AutoId)
        .with_field(FieldDescriptor::key_id("id"))
        .with_field(FieldDescriptor::scalar("name", ScalarKind::Text))
        .with_field(FieldDescriptor::embedded("address", address, Some("address_")))
}

/// `Note` with an engine-managed optimistic version property.
pub(crate) fn versioned_note_descriptor() -> EntityDescriptor {
    EntityDescriptor::new(kind("Note"), KeyStrategy::AutoId)
        .with_field(FieldDescriptor::key_id("id"))
        .with_field(FieldDescriptor::scalar("body", ScalarKind::Text))
        .with_field(FieldDescriptor::version("revision"))
}

/// `Attachment` child with an encoded key and an optional ancestor field.
pub(crate) fn attachment_descriptor(required: bool) -> EntityDescriptor {
    EntityDescriptor::new(kind("Attachment"), KeyStrategy::Encoded)
        .with_field(FieldDescriptor::key_encoded("key"))
        .with_field(FieldDescriptor::ancestor("owner", required))
        .with_field(FieldDescriptor::scalar("name", ScalarKind::Text))
}

/// `Folder` owning a single cascade-all `Attachment`.
pub(crate) fn folder_descriptor() -> EntityDescriptor {
    EntityDescriptor::new(kind("Folder"), KeyStrategy::AutoId)
        .with_field(FieldDescriptor::key_id("id"))
        .with_field(FieldDescriptor::scalar("name", ScalarKind::Text))
        .with_field(FieldDescriptor::relationship(
            "attachment",
            RelationshipDescriptor::one_to_one(kind("Attachment")).cascade(CascadePolicy::All),
        ))
}

/// `Ticket` drawing numeric ids from a named sequence.
pub(crate) fn ticket_descriptor() -> EntityDescriptor {
    EntityDescriptor::new(kind("Ticket"), KeyStrategy::Sequence { sequence: None })
        .with_field(FieldDescriptor::key_id("id"))
        .with_field(FieldDescriptor::scalar("subject", ScalarKind::Text))
}

/// Engine over a fresh memory store, with fixtures registered; the returned
/// store handle shares the engine's backing map.
pub(crate) fn engine_with(
    descriptors: Vec<EntityDescriptor>,
) -> Result<(Engine, MemoryStore), PersistError> {
    let store = MemoryStore::new();
    let mut engine = Engine::new(store.clone());
    for descriptor in descriptors {
        engine.register(descriptor)?;
    }
    Ok((engine, store))
}
