//! Module: session
//! Responsibility: the managed object graph — arena storage, lifecycle
//! state, field access by stable position, and detachment.
//! Does not own: cascade traversal (cascade), flush/transaction mechanics
//! (txn), or property mapping (mapper).
//!
//! A session is single-threaded and short-lived: one object graph, one
//! batch manager pair, at most one active store transaction.

pub(crate) mod lifecycle;
#[cfg(test)]
mod tests;

use crate::{
    batch::BatchManager,
    config::EngineConfig,
    entity::Entity,
    error::PersistError,
    key::{Key, KindName},
    mapper,
    meta::{EntityDescriptor, FieldKind, MetadataRegistry},
    obs::sink::{ExecKind, Span},
    sequence::SequenceAllocator,
    store::Store,
    txn::ActiveTxn,
    value::Value,
};
use std::sync::Arc;

pub use lifecycle::LifecycleState;

///
/// ObjectId
///
/// Arena handle for a managed object. Valid only within the session that
/// issued it.
///

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ObjectId(usize);

impl ObjectId {
    pub(crate) const fn from_index(index: usize) -> Self {
        Self(index)
    }

    pub(crate) const fn index(self) -> usize {
        self.0
    }
}

///
/// ObjectRef
///
/// Target of a one-to-one field: an object attached to this session, or a
/// bare key for references loaded from the store but not yet materialized.
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ObjectRef {
    Attached(ObjectId),
    Key(Key),
}

///
/// Slot
///
/// One field's in-memory storage, indexed by the field's stable position.
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Slot {
    Value(Value),
    Embedded(Option<Vec<Slot>>),
    Reference(Option<ObjectRef>),
    Collection(Vec<ObjectId>),
}

impl Slot {
    pub(crate) fn default_for(kind: &FieldKind) -> Self {
        use crate::meta::relationship::Cardinality;

        match kind {
            FieldKind::Embedded { .. } => Self::Embedded(None),
            FieldKind::Relationship(rel) => match rel.cardinality {
                Cardinality::OneToOne => Self::Reference(None),
                Cardinality::OneToMany => Self::Collection(Vec::new()),
            },
            _ => Self::Value(Value::Null),
        }
    }
}

///
/// OwnedPosition
///
/// Where an object sits inside its owning collection: the ordering index,
/// plus the implicit index property name when the relationship has no
/// explicit index field.
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct OwnedPosition {
    pub index_property: Option<String>,
    pub index: usize,
}

///
/// Baseline
///
/// Last-known-persisted state of an object, captured after each successful
/// flush. Update diffing and rollback both read from here.
///

#[derive(Clone, Debug)]
pub(crate) struct Baseline {
    pub slots: Vec<Slot>,
    pub version: Option<i64>,
}

///
/// ManagedObject
///

#[derive(Clone, Debug)]
pub(crate) struct ManagedObject {
    pub descriptor: Arc<EntityDescriptor>,
    pub slots: Vec<Slot>,
    pub key: Option<Key>,
    pub state: LifecycleState,
    pub baseline: Option<Baseline>,
    /// Set when the object was inserted as an owned collection element;
    /// drives ordering-index rewrites.
    pub owned: Option<OwnedPosition>,
}

impl ManagedObject {
    pub(crate) fn new(descriptor: Arc<EntityDescriptor>) -> Self {
        let slots = descriptor
            .fields()
            .iter()
            .map(|f| Slot::default_for(&f.kind))
            .collect();

        Self {
            descriptor,
            slots,
            key: None,
            state: LifecycleState::Transient,
            baseline: None,
            owned: None,
        }
    }

    pub(crate) fn version(&self) -> Option<i64> {
        let position = self.descriptor.version_position()?;
        match &self.slots[position] {
            Slot::Value(Value::Int(v)) => Some(*v),
            _ => None,
        }
    }
}

///
/// DetachedObject
///
/// Value-field copy of a managed object taken across the session boundary.
/// Deliberately retains whatever values the object held at copy time — a
/// copy taken before a failed flush keeps the attempted values even though
/// rollback restored the session's objects.
///

#[derive(Clone, Debug)]
pub struct DetachedObject {
    descriptor: Arc<EntityDescriptor>,
    key: Option<Key>,
    state: LifecycleState,
    values: Vec<(String, Value)>,
}

impl DetachedObject {
    #[must_use]
    pub fn kind(&self) -> &KindName {
        self.descriptor.kind()
    }

    #[must_use]
    pub const fn key(&self) -> Option<&Key> {
        self.key.as_ref()
    }

    #[must_use]
    pub const fn state(&self) -> LifecycleState {
        self.state
    }

    #[must_use]
    pub fn value(&self, field: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, v)| v)
    }
}

///
/// Engine
///
/// The persistence engine: a store client, the metadata registry, and
/// configuration. The store is a constructor parameter — there is no global
/// service state anywhere in the crate.
///

pub struct Engine {
    store: Box<dyn Store>,
    registry: MetadataRegistry,
    config: EngineConfig,
}

impl Engine {
    pub fn new(store: impl Store + 'static) -> Self {
        Self::with_config(store, EngineConfig::default())
    }

    pub fn with_config(store: impl Store + 'static, config: EngineConfig) -> Self {
        Self {
            store: Box::new(store),
            registry: MetadataRegistry::default(),
            config,
        }
    }

    /// Register a kind's metadata. Validation runs here, once; a rejected
    /// descriptor never becomes usable and the error resurfaces on every
    /// attempt.
    pub fn register(
        &mut self,
        descriptor: EntityDescriptor,
    ) -> Result<Arc<EntityDescriptor>, PersistError> {
        self.registry.register(descriptor)
    }

    #[must_use]
    pub fn descriptor(&self, kind: &KindName) -> Option<Arc<EntityDescriptor>> {
        self.registry.get(kind)
    }

    pub(crate) fn expect_descriptor(
        &self,
        kind: &KindName,
    ) -> Result<Arc<EntityDescriptor>, PersistError> {
        self.registry.expect(kind)
    }

    pub(crate) fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Open a session over this engine.
    #[must_use]
    pub fn session(&self) -> Session<'_> {
        Session {
            engine: self,
            objects: Vec::new(),
            allocator: SequenceAllocator::new(&self.config),
            insert_batch: BatchManager::new(),
            delete_batch: BatchManager::new(),
            txn: None,
        }
    }
}

///
/// Session
///

pub struct Session<'e> {
    pub(crate) engine: &'e Engine,
    pub(crate) objects: Vec<ManagedObject>,
    pub(crate) allocator: SequenceAllocator,
    pub(crate) insert_batch: BatchManager<ObjectId>,
    pub(crate) delete_batch: BatchManager<ObjectId>,
    pub(crate) txn: Option<ActiveTxn>,
}

impl Session<'_> {
    // ======================================================================
    // Object construction & inspection
    // ======================================================================

    /// Create a transient object of the given kind.
    pub fn create(&mut self, kind: &str) -> Result<ObjectId, PersistError> {
        let kind = KindName::try_from_str(kind)
            .map_err(|err| PersistError::illegal_state(err.to_string()))?;
        let descriptor = self.engine.expect_descriptor(&kind)?;

        self.objects.push(ManagedObject::new(descriptor));

        Ok(ObjectId(self.objects.len() - 1))
    }

    #[must_use]
    pub fn state(&self, id: ObjectId) -> LifecycleState {
        self.obj(id).state
    }

    #[must_use]
    pub fn key(&self, id: ObjectId) -> Option<&Key> {
        self.obj(id).key.as_ref()
    }

    #[must_use]
    pub fn kind(&self, id: ObjectId) -> &KindName {
        self.obj(id).descriptor.kind()
    }

    /// Read a value field.
    pub fn value(&self, id: ObjectId, field: &str) -> Result<&Value, PersistError> {
        let (object, position) = self.field(id, field)?;
        match &object.slots[position] {
            Slot::Value(value) => Ok(value),
            _ => Err(PersistError::mapping(
                object.descriptor.kind(),
                field,
                "field is not a value field",
            )),
        }
    }

    /// Read a one-to-one reference field.
    pub fn reference(&self, id: ObjectId, field: &str) -> Result<Option<&ObjectRef>, PersistError> {
        let (object, position) = self.field(id, field)?;
        match &object.slots[position] {
            Slot::Reference(target) => Ok(target.as_ref()),
            _ => Err(PersistError::mapping(
                object.descriptor.kind(),
                field,
                "field is not a single-reference field",
            )),
        }
    }

    /// Read a one-to-many collection field.
    pub fn collection(&self, id: ObjectId, field: &str) -> Result<&[ObjectId], PersistError> {
        let (object, position) = self.field(id, field)?;
        match &object.slots[position] {
            Slot::Collection(children) => Ok(children),
            _ => Err(PersistError::mapping(
                object.descriptor.kind(),
                field,
                "field is not a collection field",
            )),
        }
    }

    // ======================================================================
    // Field mutation
    // ======================================================================

    /// Write a value field. Ancestor and key-companion fields enforce their
    /// write-once rules here, at assignment time.
    pub fn set_value(
        &mut self,
        id: ObjectId,
        field: &str,
        value: Value,
    ) -> Result<(), PersistError> {
        let position = self.position(id, field)?;
        let object = &self.objects[id.index()];
        let descriptor = Arc::clone(&object.descriptor);
        let field_descriptor = descriptor.field(position).expect("position resolved");

        match &field_descriptor.kind {
            FieldKind::Scalar(scalar) => {
                mapper::convert::check_scalar(descriptor.kind(), field, scalar, &value)?;
            }
            FieldKind::ShortBlob { cap } => match &value {
                Value::Null => {}
                Value::Blob(bytes) if bytes.len() <= *cap => {}
                Value::Blob(bytes) => {
                    return Err(PersistError::mapping(
                        descriptor.kind(),
                        field,
                        format!("{} bytes exceed the short blob cap of {cap}", bytes.len()),
                    ));
                }
                other => {
                    return Err(PersistError::mapping(
                        descriptor.kind(),
                        field,
                        format!("expected a blob value, found {}", other.tag()),
                    ));
                }
            },
            FieldKind::Blob => {
                if !matches!(value, Value::Null | Value::Blob(_)) {
                    return Err(PersistError::mapping(
                        descriptor.kind(),
                        field,
                        format!("expected a blob value, found {}", value.tag()),
                    ));
                }
            }
            FieldKind::Collection { element, .. } => {
                if let Value::List(items) = &value {
                    for item in items {
                        if !item.is_scalar() {
                            return Err(PersistError::mapping(
                                descriptor.kind(),
                                field,
                                "nested lists are not supported",
                            ));
                        }
                        mapper::convert::check_scalar(descriptor.kind(), field, element, item)?;
                    }
                } else if !value.is_null() {
                    return Err(PersistError::mapping(
                        descriptor.kind(),
                        field,
                        format!("expected a list value, found {}", value.tag()),
                    ));
                }
            }
            FieldKind::KeyAncestor { .. } => {
                self.check_ancestor_assignment(id, field, position, &value)?;
            }
            FieldKind::KeyId => {
                self.check_key_id_assignment(id, field, &value)?;
            }
            FieldKind::KeyName => {
                if !matches!(value, Value::Null | Value::Text(_)) {
                    return Err(PersistError::mapping(
                        descriptor.kind(),
                        field,
                        format!("expected a text value, found {}", value.tag()),
                    ));
                }
            }
            FieldKind::KeyEncoded => {
                if let Value::Text(encoded) = &value {
                    // Decode eagerly so malformed identities fail at
                    // assignment, not at flush.
                    crate::key::decode_key(encoded)?;
                } else if !value.is_null() {
                    return Err(PersistError::mapping(
                        descriptor.kind(),
                        field,
                        format!("expected an encoded key string, found {}", value.tag()),
                    ));
                }
            }
            FieldKind::Version => {
                return Err(PersistError::illegal_state(format!(
                    "version field '{field}' of {} is engine-managed",
                    descriptor.kind()
                )));
            }
            FieldKind::Embedded { .. } | FieldKind::Relationship(_) => {
                return Err(PersistError::mapping(
                    descriptor.kind(),
                    field,
                    "field requires its dedicated setter",
                ));
            }
        }

        self.touch(id);
        self.objects[id.index()].slots[position] = Slot::Value(value);

        Ok(())
    }

    /// Point a one-to-one field at another session object (or clear it).
    pub fn set_reference(
        &mut self,
        id: ObjectId,
        field: &str,
        target: Option<ObjectId>,
    ) -> Result<(), PersistError> {
        let position = self.relationship_position(id, field, false)?;

        self.touch(id);
        self.objects[id.index()].slots[position] =
            Slot::Reference(target.map(ObjectRef::Attached));

        Ok(())
    }

    /// Point a one-to-one field at a bare key (a reference loaded or built
    /// without materializing the target).
    pub fn set_reference_key(
        &mut self,
        id: ObjectId,
        field: &str,
        target: Option<Key>,
    ) -> Result<(), PersistError> {
        let position = self.relationship_position(id, field, false)?;

        self.touch(id);
        self.objects[id.index()].slots[position] = Slot::Reference(target.map(ObjectRef::Key));

        Ok(())
    }

    /// Append an element to a one-to-many field, in container iteration
    /// order.
    pub fn collection_push(
        &mut self,
        id: ObjectId,
        field: &str,
        element: ObjectId,
    ) -> Result<(), PersistError> {
        let position = self.relationship_position(id, field, true)?;

        self.touch(id);
        let Slot::Collection(children) = &mut self.objects[id.index()].slots[position] else {
            unreachable!("relationship_position verified the container shape");
        };
        children.push(element);

        Ok(())
    }

    /// Null out an embedded field. Its leaf properties are still written,
    /// each with an explicit null value.
    pub fn set_embedded_null(&mut self, id: ObjectId, field: &str) -> Result<(), PersistError> {
        let position = self.embedded_position(id, field)?;

        self.touch(id);
        self.objects[id.index()].slots[position] = Slot::Embedded(None);

        Ok(())
    }

    /// Write one leaf of an embedded field, materializing the embedded
    /// record when absent.
    pub fn set_embedded_leaf(
        &mut self,
        id: ObjectId,
        field: &str,
        leaf: &str,
        value: Value,
    ) -> Result<(), PersistError> {
        let position = self.embedded_position(id, field)?;
        let object = &self.objects[id.index()];
        let descriptor = Arc::clone(&object.descriptor);
        let FieldKind::Embedded {
            descriptor: embedded,
            ..
        } = &descriptor.field(position).expect("position resolved").kind
        else {
            unreachable!("embedded_position verified the field kind");
        };

        let leaf_position = embedded
            .fields
            .iter()
            .position(|f| f.name == leaf)
            .ok_or_else(|| {
                PersistError::mapping(
                    descriptor.kind(),
                    field,
                    format!("embedded record has no leaf '{leaf}'"),
                )
            })?;
        if let FieldKind::Scalar(scalar) = &embedded.fields[leaf_position].kind {
            mapper::convert::check_scalar(descriptor.kind(), leaf, scalar, &value)?;
        }

        let defaults: Vec<Slot> = embedded
            .fields
            .iter()
            .map(|f| Slot::default_for(&f.kind))
            .collect();

        self.touch(id);
        let Slot::Embedded(record) = &mut self.objects[id.index()].slots[position] else {
            unreachable!("embedded_position verified the field kind");
        };
        let record = record.get_or_insert(defaults);
        record[leaf_position] = Slot::Value(value);

        Ok(())
    }

    // ======================================================================
    // Detachment
    // ======================================================================

    /// Copy an object's value fields out of the session. The copy is frozen
    /// at the current field values and never tracked again.
    #[must_use]
    pub fn detach_copy(&self, id: ObjectId) -> DetachedObject {
        let object = self.obj(id);
        let mut values = Vec::new();

        for (position, field) in object.descriptor.fields().iter().enumerate() {
            match &object.slots[position] {
                Slot::Value(value) => values.push((field.name.clone(), value.clone())),
                Slot::Embedded(Some(record)) => {
                    if let FieldKind::Embedded {
                        descriptor: embedded,
                        ..
                    } = &field.kind
                    {
                        for (leaf_position, leaf) in embedded.fields.iter().enumerate() {
                            if let Slot::Value(value) = &record[leaf_position] {
                                values.push((
                                    format!("{}.{}", field.name, leaf.name),
                                    value.clone(),
                                ));
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        DetachedObject {
            descriptor: Arc::clone(&object.descriptor),
            key: object.key.clone(),
            state: if object.state.is_dirty() {
                LifecycleState::DetachedDirty
            } else {
                LifecycleState::DetachedClean
            },
            values,
        }
    }

    // ======================================================================
    // Load
    // ======================================================================

    /// Fetch an entity by key and attach it as a clean persistent object.
    /// One-to-many fields attach empty; related objects are materialized on
    /// demand by the caller.
    pub fn load(&mut self, key: &Key) -> Result<ObjectId, PersistError> {
        let _span = Span::new(ExecKind::Load);

        let descriptor = self.engine.expect_descriptor(key.kind())?;
        let txn = self.txn.as_ref().map(ActiveTxn::handle);
        let entity = self
            .engine
            .store()
            .get(txn.as_ref(), key)
            .map_err(|fault| fault.into_persist("get"))?;

        self.attach_loaded(descriptor, &entity)
    }

    pub(crate) fn attach_loaded(
        &mut self,
        descriptor: Arc<EntityDescriptor>,
        entity: &Entity,
    ) -> Result<ObjectId, PersistError> {
        let slots = mapper::apply_properties(&descriptor, entity)?;
        let version = descriptor
            .version_position()
            .and_then(|p| match &slots[p] {
                Slot::Value(Value::Int(v)) => Some(*v),
                _ => None,
            });

        let object = ManagedObject {
            baseline: Some(Baseline {
                slots: slots.clone(),
                version,
            }),
            slots,
            key: Some(entity.key().clone()),
            state: LifecycleState::PersistentClean,
            owned: None,
            descriptor,
        };
        self.objects.push(object);

        Ok(ObjectId(self.objects.len() - 1))
    }

    // ======================================================================
    // Internal helpers
    // ======================================================================

    pub(crate) fn obj(&self, id: ObjectId) -> &ManagedObject {
        self.objects.get(id.index()).expect("stale ObjectId")
    }

    pub(crate) fn obj_mut(&mut self, id: ObjectId) -> &mut ManagedObject {
        self.objects.get_mut(id.index()).expect("stale ObjectId")
    }

    fn field(&self, id: ObjectId, field: &str) -> Result<(&ManagedObject, usize), PersistError> {
        let object = self.obj(id);
        let position = object.descriptor.field_position(field).ok_or_else(|| {
            PersistError::mapping(object.descriptor.kind(), field, "unknown field")
        })?;

        Ok((object, position))
    }

    pub(crate) fn position(&self, id: ObjectId, field: &str) -> Result<usize, PersistError> {
        self.field(id, field).map(|(_, position)| position)
    }

    fn relationship_position(
        &self,
        id: ObjectId,
        field: &str,
        many: bool,
    ) -> Result<usize, PersistError> {
        let (object, position) = self.field(id, field)?;
        let expected = if many {
            matches!(object.slots[position], Slot::Collection(_))
        } else {
            matches!(object.slots[position], Slot::Reference(_))
        };

        if expected {
            Ok(position)
        } else {
            Err(PersistError::mapping(
                object.descriptor.kind(),
                field,
                if many {
                    "field is not a collection field"
                } else {
                    "field is not a single-reference field"
                },
            ))
        }
    }

    fn embedded_position(&self, id: ObjectId, field: &str) -> Result<usize, PersistError> {
        let (object, position) = self.field(id, field)?;
        if matches!(object.slots[position], Slot::Embedded(_)) {
            Ok(position)
        } else {
            Err(PersistError::mapping(
                object.descriptor.kind(),
                field,
                "field is not an embedded field",
            ))
        }
    }

    /// Record a mutation: snapshot for the active transaction, then apply
    /// the lifecycle transition.
    pub(crate) fn touch(&mut self, id: ObjectId) {
        if let Some(txn) = self.txn.as_mut() {
            txn.snapshot(id, &self.objects[id.index()]);
        }

        let object = &mut self.objects[id.index()];
        object.state = object.state.after_mutation();
    }

    // Ancestor fields are write-once; the entity group is fixed with the key.
    fn check_ancestor_assignment(
        &self,
        id: ObjectId,
        field: &str,
        position: usize,
        value: &Value,
    ) -> Result<(), PersistError> {
        let object = self.obj(id);

        if !matches!(value, Value::Null | Value::Key(_)) {
            return Err(PersistError::mapping(
                object.descriptor.kind(),
                field,
                format!("expected a key value, found {}", value.tag()),
            ));
        }

        if object.key.is_some() && !value.is_null() {
            return Err(PersistError::ImmutableAncestor {
                kind: object.descriptor.kind().to_string(),
                field: field.to_string(),
            });
        }

        if let Slot::Value(current) = &object.slots[position]
            && !current.is_null()
            && !value.is_null()
            && current != value
        {
            return Err(PersistError::ImmutableAncestor {
                kind: object.descriptor.kind().to_string(),
                field: field.to_string(),
            });
        }

        Ok(())
    }

    // A numeric key identifier never changes once the store assigned it.
    fn check_key_id_assignment(
        &self,
        id: ObjectId,
        field: &str,
        value: &Value,
    ) -> Result<(), PersistError> {
        let object = self.obj(id);

        if !matches!(value, Value::Null | Value::Int(_)) {
            return Err(PersistError::mapping(
                object.descriptor.kind(),
                field,
                format!("expected an integer value, found {}", value.tag()),
            ));
        }

        if let Some(assigned) = object.key.as_ref().and_then(|k| k.id().id())
            && value.as_int() != Some(assigned)
        {
            return Err(PersistError::illegal_state(format!(
                "key id of {} is {assigned} and can never change",
                object.descriptor.kind()
            )));
        }

        Ok(())
    }

    pub(crate) fn capture_baseline(&mut self, id: ObjectId) {
        let object = &mut self.objects[id.index()];
        let version = object.version();
        object.baseline = Some(Baseline {
            slots: object.slots.clone(),
            version,
        });
    }

    pub(crate) fn sequence_identity(
        descriptor: &EntityDescriptor,
    ) -> Option<crate::sequence::SequenceIdentity> {
        use crate::meta::KeyStrategy;
        use crate::sequence::SequenceIdentity;

        match descriptor.strategy() {
            KeyStrategy::AutoId | KeyStrategy::Encoded => {
                Some(SequenceIdentity::Kind(descriptor.kind().clone()))
            }
            KeyStrategy::Sequence { .. } => descriptor.sequence_name().map(SequenceIdentity::Named),
            KeyStrategy::Name => None,
        }
    }

    // Pre-insert identity carried by a key-encoded field, if any.
    pub(crate) fn declared_encoded_key(&self, id: ObjectId) -> Result<Option<Key>, PersistError> {
        let object = self.obj(id);
        let Some(position) = object.descriptor.key_encoded_position() else {
            return Ok(None);
        };
        match &object.slots[position] {
            Slot::Value(Value::Text(encoded)) => crate::key::decode_key(encoded).map(Some),
            _ => Ok(None),
        }
    }

    // Explicit ancestor carried by the object itself: the ancestor field, or
    // the parent of a declared encoded key.
    pub(crate) fn declared_ancestor(&self, id: ObjectId) -> Result<Option<Key>, PersistError> {
        let object = self.obj(id);

        if let Some(position) = object.descriptor.ancestor_position()
            && let Slot::Value(Value::Key(parent)) = &object.slots[position]
        {
            return Ok(Some(parent.clone()));
        }

        Ok(self
            .declared_encoded_key(id)?
            .and_then(|key| key.parent().cloned()))
    }

    // Scalar value expected at a position; used by the key-assignment path.
    pub(crate) fn slot_value(&self, id: ObjectId, position: usize) -> Option<&Value> {
        match &self.obj(id).slots[position] {
            Slot::Value(value) => Some(value),
            _ => None,
        }
    }

    pub(crate) fn set_slot_value(&mut self, id: ObjectId, position: usize, value: Value) {
        self.objects[id.index()].slots[position] = Slot::Value(value);
    }
}
