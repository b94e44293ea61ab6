//! Module: cascade
//! Responsibility: walking relationship fields of a root object and turning
//! inserts/updates/deletes into pending operations — assigning keys,
//! maintaining back-references and ordering indexes, and recursing per the
//! cascade policy.
//! Does not own: issuing store calls or transaction state (txn), property
//! mapping (mapper), ancestor priority rules (group).
//!
//! Invariants:
//! - A parent's key is established before any child is cascaded, so every
//!   owned child lands in the parent's entity group.
//! - Collection elements receive contiguous 0-based ordering indexes in
//!   container iteration order.
//! - Grouping violations surface before any store call is issued.


use crate::{
    entity::Entity,
    error::PersistError,
    group,
    key::{Key, KeyId, encode_key},
    mapper,
    meta::{KeyStrategy, relationship::{Cardinality, OrderingPolicy, RelationshipDescriptor}},
    obs::sink::{self, ExecKind, MetricsEvent, Span},
    session::{LifecycleState, ManagedObject, ObjectId, ObjectRef, OwnedPosition, Session, Slot},
    value::Value,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

///
/// OpAction
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum OpAction {
    Insert,
    Update,
    Delete,
}

///
/// PendingOperation
///
/// One scheduled store mutation. Produced here, consumed by the flush path;
/// lives for exactly one flush cycle. Operations sharing a `batch_token`
/// (and an entity group) are candidates for one batched store call.
///

#[derive(Clone, Debug)]
pub(crate) struct PendingOperation {
    pub object: Option<ObjectId>,
    pub action: OpAction,
    pub entity: Option<Entity>,
    pub key: Key,
    pub group_root: Key,
    pub batch_token: Option<u32>,
}

///
/// CascadeScope
///
/// Book-keeping for one cascade: the re-entrancy guard, pre-mutation object
/// snapshots (restored when the cascade fails before any write), the
/// delete-recursion guard, and the batch-token counter.
///

#[derive(Debug, Default)]
pub(crate) struct CascadeScope {
    visiting: BTreeSet<ObjectId>,
    saved: BTreeMap<ObjectId, ManagedObject>,
    deleting: BTreeSet<Key>,
    next_token: u32,
}

impl CascadeScope {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn token(&mut self) -> u32 {
        self.next_token += 1;
        self.next_token
    }
}

impl Session<'_> {
    // ======================================================================
    // Public persistence operations
    // ======================================================================

    /// Insert a root object, cascading through its relationship fields.
    /// Inside a batch window the root only accumulates; the cascade runs
    /// when the window closes.
    pub fn insert(&mut self, root: ObjectId) -> Result<(), PersistError> {
        if self.insert_batch.is_batch_operation() {
            return self.insert_batch.add(root);
        }

        let mut span = Span::new(ExecKind::Insert);
        let written = self.insert_roots(vec![root])?;
        span.set_entities(written);

        Ok(())
    }

    /// Insert several roots through one batch window, coalescing their
    /// writes per entity group.
    pub fn insert_many(&mut self, roots: &[ObjectId]) -> Result<(), PersistError> {
        self.insert_batch.start_batch_operation()?;
        for &root in roots {
            self.insert(root)?;
        }
        self.finish_batch_inserts()
    }

    /// Close the insert batch window and flush everything accumulated.
    pub fn finish_batch_inserts(&mut self) -> Result<(), PersistError> {
        // Move the manager out so its handler can borrow the session.
        let mut manager = std::mem::take(&mut self.insert_batch);
        let result = manager.finish_batch_operation(|roots| {
            let mut span = Span::new(ExecKind::Insert);
            let written = self.insert_roots(roots)?;
            span.set_entities(written);
            Ok(())
        });
        self.insert_batch = manager;

        result
    }

    /// Re-write a dirty object: changed fields, collection membership and
    /// ordering, and cascaded additions/removals.
    pub fn update(&mut self, root: ObjectId) -> Result<(), PersistError> {
        let mut span = Span::new(ExecKind::Update);

        let mut ops = Vec::new();
        let mut scope = CascadeScope::new();
        let built = self.update_ops(root, &mut ops, &mut scope);
        let written = self.finish_cascade(built, ops, scope)?;
        span.set_entities(written);

        Ok(())
    }

    /// Flush every dirty object in the session through one cycle.
    pub fn flush(&mut self) -> Result<(), PersistError> {
        let dirty: Vec<ObjectId> = self
            .objects
            .iter()
            .enumerate()
            .filter(|(_, o)| o.state == LifecycleState::PersistentDirty)
            .map(|(i, _)| ObjectId::from_index(i))
            .collect();
        if dirty.is_empty() {
            return Ok(());
        }

        let mut span = Span::new(ExecKind::Update);

        let mut ops = Vec::new();
        let mut scope = CascadeScope::new();
        let mut built = Ok(());
        for id in dirty {
            built = self.update_ops(id, &mut ops, &mut scope);
            if built.is_err() {
                break;
            }
        }
        let written = self.finish_cascade(built, ops, scope)?;
        span.set_entities(written);

        Ok(())
    }

    /// Delete a root object, cascading per the relationship delete policy.
    pub fn delete(&mut self, root: ObjectId) -> Result<(), PersistError> {
        if self.delete_batch.is_batch_operation() {
            return self.delete_batch.add(root);
        }

        let mut span = Span::new(ExecKind::Delete);

        let mut ops = Vec::new();
        let mut scope = CascadeScope::new();
        let built = self.cascade_delete(root, None, &mut ops, &mut scope);
        let written = self.finish_cascade(built, ops, scope)?;
        span.set_entities(written);

        Ok(())
    }

    /// Delete several roots through one batch window.
    pub fn delete_many(&mut self, roots: &[ObjectId]) -> Result<(), PersistError> {
        self.delete_batch.start_batch_operation()?;
        for &root in roots {
            self.delete(root)?;
        }
        self.finish_batch_deletes()
    }

    /// Close the delete batch window and flush everything accumulated.
    pub fn finish_batch_deletes(&mut self) -> Result<(), PersistError> {
        let mut manager = std::mem::take(&mut self.delete_batch);
        let result = manager.finish_batch_operation(|roots| {
            let mut span = Span::new(ExecKind::Delete);

            let mut ops = Vec::new();
            let mut scope = CascadeScope::new();
            let token = scope.token();
            let mut built = Ok(());
            for root in roots {
                built = self.cascade_delete(root, Some(token), &mut ops, &mut scope);
                if built.is_err() {
                    break;
                }
            }
            let written = self.finish_cascade(built, ops, scope)?;
            span.set_entities(written);

            Ok(())
        });
        self.delete_batch = manager;

        result
    }

    /// Remove the given elements from an indexed collection field and
    /// re-compute the remaining elements' ordering indexes so they stay
    /// contiguous from 0. O(n) in collection size; runs immediately, before
    /// the next flush.
    pub fn remove_elements(
        &mut self,
        root: ObjectId,
        field: &str,
        elements: &[ObjectId],
    ) -> Result<(), PersistError> {
        let position = self.position(root, field)?;
        let rel = self
            .obj(root)
            .descriptor
            .field(position)
            .and_then(|f| f.relationship_descriptor())
            .cloned()
            .ok_or_else(|| {
                PersistError::mapping(
                    self.obj(root).descriptor.kind(),
                    field,
                    "field is not a relationship field",
                )
            })?;
        if rel.cardinality != Cardinality::OneToMany {
            return Err(PersistError::mapping(
                self.obj(root).descriptor.kind(),
                field,
                "remove_elements requires a one-to-many field",
            ));
        }

        self.touch(root);
        let Slot::Collection(children) = &mut self.obj_mut(root).slots[position] else {
            unreachable!("one-to-many fields hold collection slots");
        };
        children.retain(|c| !elements.contains(c));
        let remaining = children.clone();

        // Unlink removed elements in memory. Whether their entities are
        // deleted or soft-detached is the flush path's decision, driven by
        // the cascade policy.
        for &removed in elements {
            self.unlink_element(removed, &rel)?;
        }

        self.reindex_elements(field, &rel, &remaining)
    }

    // ======================================================================
    // Insert cascade
    // ======================================================================

    // Cascade every root, then flush once. Batched root writes share one
    // token per entity group so same-group roots coalesce into a single
    // store call.
    fn insert_roots(&mut self, roots: Vec<ObjectId>) -> Result<u64, PersistError> {
        let mut scope = CascadeScope::new();
        let mut per_root_ops: Vec<Vec<PendingOperation>> = Vec::with_capacity(roots.len());

        let mut built = Ok(());
        for &root in &roots {
            let mut ops = Vec::new();
            built = self.cascade_insert(root, None, None, None, &mut ops, &mut scope);
            per_root_ops.push(ops);
            if built.is_err() {
                break;
            }
        }

        // Share a token among root-level writes of the same group.
        let mut group_tokens: BTreeMap<Key, u32> = BTreeMap::new();
        if built.is_ok() && roots.len() > 1 {
            for ops in &mut per_root_ops {
                if let Some(root_op) = ops.last_mut() {
                    let token = *group_tokens
                        .entry(root_op.group_root.clone())
                        .or_insert_with(|| scope.token());
                    root_op.batch_token = Some(token);
                }
            }
        }

        let ops: Vec<PendingOperation> = per_root_ops.into_iter().flatten().collect();
        self.finish_cascade(built, ops, scope)
    }

    fn cascade_insert(
        &mut self,
        id: ObjectId,
        cascaded_parent: Option<Key>,
        owned: Option<OwnedPosition>,
        root_token: Option<u32>,
        ops: &mut Vec<PendingOperation>,
        scope: &mut CascadeScope,
    ) -> Result<(), PersistError> {
        // Re-entrancy guard: a bidirectional field can recurse back into an
        // object that is already being inserted.
        if !scope.visiting.insert(id) {
            return Ok(());
        }

        match self.obj(id).state {
            LifecycleState::Transient => {}
            LifecycleState::Deleted => {
                return Err(PersistError::illegal_state(format!(
                    "cannot insert a deleted {}",
                    self.obj(id).descriptor.kind()
                )));
            }
            // Already persistent: nothing to insert.
            _ => return Ok(()),
        }

        self.save_into(scope, id);
        self.touch(id);

        let ancestor = group::resolve_ancestor(self, id, cascaded_parent.as_ref())?;
        let key = self.assign_key(id, ancestor)?;
        self.obj_mut(id).owned = owned;

        self.insert_relationships(id, &key, ops, scope)?;

        let entity = self.build_write_entity(id, &key, Some(1))?;
        ops.push(PendingOperation {
            object: Some(id),
            action: OpAction::Insert,
            entity: Some(entity),
            group_root: key.group_root().clone(),
            key,
            batch_token: root_token,
        });

        Ok(())
    }

    // Resolve this object's complete key: reuse an existing assignment
    // (id allocation survives rollback), honor declared identity, or
    // allocate from the sequence allocator.
    fn assign_key(
        &mut self,
        id: ObjectId,
        ancestor: Option<Key>,
    ) -> Result<Key, PersistError> {
        if let Some(existing) = self.obj(id).key.clone() {
            return Ok(existing);
        }

        let descriptor = Arc::clone(&self.obj(id).descriptor);
        let kind = descriptor.kind().clone();

        let key_id = match descriptor.strategy() {
            KeyStrategy::Name => {
                let position = descriptor.key_name_position().expect("validated at registration");
                let name = self
                    .slot_value(id, position)
                    .and_then(Value::as_text)
                    .map(str::to_string)
                    .ok_or_else(|| {
                        PersistError::illegal_state(format!(
                            "{kind} uses a name key but its key-name field is unset"
                        ))
                    })?;
                KeyId::Name(name)
            }
            KeyStrategy::AutoId | KeyStrategy::Sequence { .. } => {
                KeyId::Id(self.preset_or_allocated_id(id, &descriptor)?)
            }
            KeyStrategy::Encoded => match self.declared_encoded_key(id)? {
                Some(declared) => {
                    if declared.kind() != &kind {
                        return Err(PersistError::mapping(
                            &kind,
                            "key",
                            format!(
                                "declared key is of kind {}, expected {kind}",
                                declared.kind()
                            ),
                        ));
                    }
                    declared.id().clone()
                }
                None => KeyId::Id(self.preset_or_allocated_id(id, &descriptor)?),
            },
        };

        let key = Key::from_parts(kind, key_id, ancestor);

        // Post-assignment write-backs: companions and the ancestor field
        // reflect the assigned identity.
        if let Some(position) = descriptor.key_id_position()
            && let Some(numeric) = key.id().id()
        {
            self.set_slot_value(id, position, Value::Int(numeric));
        }
        if let Some(position) = descriptor.key_name_position()
            && let Some(name) = key.id().name()
        {
            self.set_slot_value(id, position, Value::Text(name.to_string()));
        }
        if let Some(position) = descriptor.key_encoded_position() {
            self.set_slot_value(id, position, Value::Text(encode_key(&key)));
        }
        if let Some(position) = descriptor.ancestor_position() {
            let value = key
                .parent()
                .map_or(Value::Null, |parent| Value::Key(parent.clone()));
            self.set_slot_value(id, position, value);
        }

        let object = self.obj_mut(id);
        object.key = Some(key.clone());
        object.state = LifecycleState::PersistentNew;

        Ok(key)
    }

    // An application-assigned numeric id wins; otherwise draw from the
    // kind's id space or its named sequence.
    fn preset_or_allocated_id(
        &mut self,
        id: ObjectId,
        descriptor: &Arc<crate::meta::EntityDescriptor>,
    ) -> Result<i64, PersistError> {
        let preset = descriptor
            .key_id_position()
            .and_then(|p| self.slot_value(id, p))
            .and_then(Value::as_int);
        if let Some(preset) = preset {
            return Ok(preset);
        }

        let identity = Self::sequence_identity(descriptor.as_ref()).ok_or_else(|| {
            PersistError::illegal_state(format!(
                "{} has no numeric id source",
                descriptor.kind()
            ))
        })?;
        let engine = self.engine;
        self.allocator.next(engine.store(), &identity)
    }

    fn insert_relationships(
        &mut self,
        id: ObjectId,
        key: &Key,
        ops: &mut Vec<PendingOperation>,
        scope: &mut CascadeScope,
    ) -> Result<(), PersistError> {
        for (position, field_name, rel) in self.relationships_of(id) {
            match rel.cardinality {
                Cardinality::OneToOne => {
                    let target = match &self.obj(id).slots[position] {
                        Slot::Reference(target) => target.clone(),
                        _ => unreachable!("one-to-one fields hold reference slots"),
                    };
                    self.insert_single_related(id, key, &field_name, &rel, target, ops, scope)?;
                }
                Cardinality::OneToMany => {
                    let children = match &self.obj(id).slots[position] {
                        Slot::Collection(children) => children.clone(),
                        _ => unreachable!("one-to-many fields hold collection slots"),
                    };
                    sink::record(MetricsEvent::CascadeFanout {
                        children: children.len() as u64,
                    });
                    let token = scope.token();
                    for (index, child) in children.into_iter().enumerate() {
                        self.insert_element(
                            id, key, &field_name, &rel, child, index, token, ops, scope,
                        )?;
                    }
                }
            }
        }

        Ok(())
    }

    fn insert_single_related(
        &mut self,
        id: ObjectId,
        key: &Key,
        field_name: &str,
        rel: &RelationshipDescriptor,
        target: Option<ObjectRef>,
        ops: &mut Vec<PendingOperation>,
        scope: &mut CascadeScope,
    ) -> Result<(), PersistError> {
        match target {
            None => Ok(()),
            Some(ObjectRef::Key(child_key)) => {
                if rel.owned {
                    group::check_owned_child(&child_key, key)?;
                }
                Ok(())
            }
            Some(ObjectRef::Attached(child)) => {
                let child_state = self.obj(child).state;
                if child_state.is_persistent() {
                    if rel.owned {
                        let child_key = self
                            .obj(child)
                            .key
                            .clone()
                            .expect("persistent objects carry keys");
                        group::check_owned_child(&child_key, key)?;
                    }
                    return Ok(());
                }
                if child_state == LifecycleState::Deleted {
                    return Err(PersistError::illegal_state(format!(
                        "field '{field_name}' references a deleted object"
                    )));
                }
                if !rel.cascade.cascades_insert() {
                    return Err(PersistError::illegal_state(format!(
                        "field '{field_name}' references a transient object but its cascade policy does not include insert"
                    )));
                }

                self.save_into(scope, child);
                if let Some(back) = rel.back_reference() {
                    let back = back.to_string();
                    self.set_reference(child, &back, Some(id))?;
                }
                let parent = rel.owned.then(|| key.clone());
                self.cascade_insert(child, parent, None, None, ops, scope)
            }
        }
    }

    #[expect(clippy::too_many_arguments)]
    fn insert_element(
        &mut self,
        id: ObjectId,
        key: &Key,
        field_name: &str,
        rel: &RelationshipDescriptor,
        child: ObjectId,
        index: usize,
        token: u32,
        ops: &mut Vec<PendingOperation>,
        scope: &mut CascadeScope,
    ) -> Result<(), PersistError> {
        let owned_position = OwnedPosition {
            index_property: rel.implicit_index_property(field_name),
            index,
        };

        self.save_into(scope, child);

        // Back-reference before insertion, explicit ordering index as a
        // plain field write on the element.
        if let Some(back) = rel.back_reference() {
            let back = back.to_string();
            self.set_reference(child, &back, Some(id))?;
        }
        if let OrderingPolicy::Explicit { field } = &rel.ordering {
            let field = field.clone();
            self.set_value(child, &field, Value::Int(index as i64))?;
        }

        let child_state = self.obj(child).state;
        if child_state.is_persistent() {
            if rel.owned {
                let child_key = self
                    .obj(child)
                    .key
                    .clone()
                    .expect("persistent objects carry keys");
                group::check_owned_child(&child_key, key)?;
            }
            self.obj_mut(child).owned = Some(owned_position);
            return Ok(());
        }
        if child_state == LifecycleState::Deleted {
            return Err(PersistError::illegal_state(format!(
                "collection '{field_name}' contains a deleted object"
            )));
        }
        if !rel.cascade.cascades_insert() {
            return Err(PersistError::illegal_state(format!(
                "collection '{field_name}' contains a transient object but its cascade policy does not include insert"
            )));
        }

        let parent = rel.owned.then(|| key.clone());
        self.cascade_insert(child, parent, Some(owned_position), Some(token), ops, scope)
    }

    // ======================================================================
    // Update cascade
    // ======================================================================

    fn update_ops(
        &mut self,
        id: ObjectId,
        ops: &mut Vec<PendingOperation>,
        scope: &mut CascadeScope,
    ) -> Result<(), PersistError> {
        if !scope.visiting.insert(id) {
            return Ok(());
        }
        if self.obj(id).state != LifecycleState::PersistentDirty {
            return Ok(());
        }

        let key = self
            .obj(id)
            .key
            .clone()
            .expect("persistent objects carry keys");
        self.save_into(scope, id);

        for (position, field_name, rel) in self.relationships_of(id) {
            match rel.cardinality {
                Cardinality::OneToOne => {
                    let target = match &self.obj(id).slots[position] {
                        Slot::Reference(target) => target.clone(),
                        _ => unreachable!("one-to-one fields hold reference slots"),
                    };
                    self.insert_single_related(id, &key, &field_name, &rel, target, ops, scope)?;
                }
                Cardinality::OneToMany => {
                    self.update_collection(id, &key, position, &field_name, &rel, ops, scope)?;
                }
            }
        }

        let next_version = self.verify_version(id, crate::txn::VersionCheck::Increment)?;
        let entity = self.build_write_entity(id, &key, next_version)?;
        ops.push(PendingOperation {
            object: Some(id),
            action: OpAction::Update,
            entity: Some(entity),
            group_root: key.group_root().clone(),
            key,
            batch_token: None,
        });

        Ok(())
    }

    #[expect(clippy::too_many_arguments)]
    fn update_collection(
        &mut self,
        id: ObjectId,
        key: &Key,
        position: usize,
        field_name: &str,
        rel: &RelationshipDescriptor,
        ops: &mut Vec<PendingOperation>,
        scope: &mut CascadeScope,
    ) -> Result<(), PersistError> {
        let current = match &self.obj(id).slots[position] {
            Slot::Collection(children) => children.clone(),
            _ => unreachable!("one-to-many fields hold collection slots"),
        };
        let baseline: Vec<ObjectId> = match self
            .obj(id)
            .baseline
            .as_ref()
            .map(|b| &b.slots[position])
        {
            Some(Slot::Collection(children)) => children.clone(),
            _ => Vec::new(),
        };

        // Removed elements: cascade-delete or soft detach.
        let token = scope.token();
        for removed in baseline.iter().filter(|c| !current.contains(c)) {
            if rel.cascade.cascades_delete() {
                self.cascade_delete(*removed, Some(token), ops, scope)?;
            } else {
                self.unlink_element(*removed, rel)?;
            }
        }

        // Additions and ordering maintenance.
        let token = scope.token();
        for (index, child) in current.iter().enumerate() {
            let child_state = self.obj(*child).state;
            if child_state == LifecycleState::Transient {
                self.insert_element(
                    id, key, field_name, rel, *child, index, token, ops, scope,
                )?;
                continue;
            }

            if rel.owned && child_state.is_persistent() {
                let child_key = self
                    .obj(*child)
                    .key
                    .clone()
                    .expect("persistent objects carry keys");
                group::check_owned_child(&child_key, key)?;
            }

            // Re-write the ordering index when the element moved.
            let owned_position = OwnedPosition {
                index_property: rel.implicit_index_property(field_name),
                index,
            };
            let moved = self.obj(*child).owned.as_ref() != Some(&owned_position);
            if moved {
                self.save_into(scope, *child);
                if let OrderingPolicy::Explicit { field } = &rel.ordering {
                    let field = field.clone();
                    self.set_value(*child, &field, Value::Int(index as i64))?;
                } else {
                    self.touch(*child);
                }
                self.obj_mut(*child).owned = Some(owned_position);
            }
            if self.obj(*child).state == LifecycleState::PersistentDirty {
                self.update_ops(*child, ops, scope)?;
            }
        }

        Ok(())
    }

    // In-memory unlink of a soft-detached element: back-reference and owner
    // bookkeeping are cleared, but the element's entity is left in the store
    // untouched, so no lifecycle transition happens.
    fn unlink_element(
        &mut self,
        element: ObjectId,
        rel: &RelationshipDescriptor,
    ) -> Result<(), PersistError> {
        if let Some(txn) = self.txn.as_mut() {
            txn.snapshot(element, &self.objects[element.index()]);
        }

        if let Some(back) = rel.back_reference() {
            let object = self.obj_mut(element);
            if let Some(position) = object.descriptor.field_position(back) {
                object.slots[position] = Slot::Reference(None);
            }
        }
        self.obj_mut(element).owned = None;

        Ok(())
    }

    fn reindex_elements(
        &mut self,
        field_name: &str,
        rel: &RelationshipDescriptor,
        remaining: &[ObjectId],
    ) -> Result<(), PersistError> {
        for (index, child) in remaining.iter().enumerate() {
            let owned_position = OwnedPosition {
                index_property: rel.implicit_index_property(field_name),
                index,
            };
            if self.obj(*child).owned.as_ref() == Some(&owned_position) {
                continue;
            }

            if let OrderingPolicy::Explicit { field } = &rel.ordering {
                let field = field.clone();
                self.set_value(*child, &field, Value::Int(index as i64))?;
            } else {
                self.touch(*child);
            }
            self.obj_mut(*child).owned = Some(owned_position);
        }

        Ok(())
    }

    // ======================================================================
    // Delete cascade
    // ======================================================================

    fn cascade_delete(
        &mut self,
        id: ObjectId,
        token: Option<u32>,
        ops: &mut Vec<PendingOperation>,
        scope: &mut CascadeScope,
    ) -> Result<(), PersistError> {
        let state = self.obj(id).state;
        if state == LifecycleState::Deleted {
            return Ok(());
        }
        if !state.is_persistent() {
            return Err(PersistError::illegal_state(format!(
                "cannot delete a {} {}",
                state,
                self.obj(id).descriptor.kind()
            )));
        }

        let key = self
            .obj(id)
            .key
            .clone()
            .expect("persistent objects carry keys");
        // A delete cascade can circle back through bidirectional fields, or
        // hit a key already deleted earlier in this transaction.
        if !scope.deleting.insert(key.clone()) {
            return Ok(());
        }
        if self.txn.as_ref().is_some_and(|t| t.is_deleted(&key)) {
            return Ok(());
        }

        self.save_into(scope, id);
        self.touch(id);
        self.verify_version(id, crate::txn::VersionCheck::CheckOnly)?;

        for (position, _field_name, rel) in self.relationships_of(id) {
            if !rel.cascade.cascades_delete() {
                continue;
            }
            match rel.cardinality {
                Cardinality::OneToOne => {
                    let target = match &self.obj(id).slots[position] {
                        Slot::Reference(target) => target.clone(),
                        _ => unreachable!("one-to-one fields hold reference slots"),
                    };
                    match target {
                        Some(ObjectRef::Attached(child)) => {
                            if self.obj(child).state.is_persistent() {
                                self.cascade_delete(child, token, ops, scope)?;
                            }
                        }
                        // Dependents referenced by bare key are deleted by
                        // key; their own cascades are not visible here.
                        Some(ObjectRef::Key(child_key)) => {
                            if scope.deleting.insert(child_key.clone()) {
                                ops.push(PendingOperation {
                                    object: None,
                                    action: OpAction::Delete,
                                    entity: None,
                                    group_root: child_key.group_root().clone(),
                                    key: child_key,
                                    batch_token: token,
                                });
                            }
                        }
                        None => {}
                    }
                }
                Cardinality::OneToMany => {
                    let children = match &self.obj(id).slots[position] {
                        Slot::Collection(children) => children.clone(),
                        _ => unreachable!("one-to-many fields hold collection slots"),
                    };
                    let child_token = scope.token();
                    for child in children {
                        if self.obj(child).state.is_persistent() {
                            self.cascade_delete(child, Some(child_token), ops, scope)?;
                        }
                    }
                }
            }
        }

        self.obj_mut(id).state = LifecycleState::Deleted;
        ops.push(PendingOperation {
            object: Some(id),
            action: OpAction::Delete,
            entity: None,
            group_root: key.group_root().clone(),
            key,
            batch_token: token,
        });

        Ok(())
    }

    // ======================================================================
    // Shared plumbing
    // ======================================================================

    // Flush built operations, or restore the cascade's pre-mutation
    // snapshots when the cascade failed before any store call. A concurrent
    // modification is the exception: rollback already ran and partial
    // writes are accounted for, so snapshots must not be re-applied.
    fn finish_cascade(
        &mut self,
        built: Result<(), PersistError>,
        ops: Vec<PendingOperation>,
        scope: CascadeScope,
    ) -> Result<u64, PersistError> {
        let result = match built {
            Ok(()) => {
                let written = ops.len() as u64;
                self.flush_ops(ops).map(|()| written)
            }
            Err(err) => Err(err),
        };

        match result {
            Ok(written) => Ok(written),
            Err(err) => {
                if !err.is_concurrent_modification() {
                    self.restore_scope(scope);
                }
                Err(err)
            }
        }
    }

    fn restore_scope(&mut self, scope: CascadeScope) {
        for (id, saved) in scope.saved {
            self.objects[id.index()] = saved;
        }
    }

    fn save_into(&mut self, scope: &mut CascadeScope, id: ObjectId) {
        scope
            .saved
            .entry(id)
            .or_insert_with(|| self.objects[id.index()].clone());
    }

    fn relationships_of(
        &self,
        id: ObjectId,
    ) -> Vec<(usize, String, RelationshipDescriptor)> {
        self.obj(id)
            .descriptor
            .relationship_positions()
            .map(|(position, field, rel)| (position, field.name.clone(), rel.clone()))
            .collect()
    }

    // Entity construction shared by insert (version 1) and update (next
    // version). Implicit ordering indexes ride along as an extra property.
    pub(crate) fn build_write_entity(
        &mut self,
        id: ObjectId,
        key: &Key,
        version: Option<i64>,
    ) -> Result<Entity, PersistError> {
        let descriptor = Arc::clone(&self.obj(id).descriptor);

        if let (Some(position), Some(version)) = (descriptor.version_position(), version) {
            self.set_slot_value(id, position, Value::Int(version));
        }

        let properties = mapper::to_properties(&self.objects, id)?;
        let mut entity = Entity::with_properties(key.clone(), properties);

        if let Some(owned) = &self.obj(id).owned
            && let Some(index_property) = &owned.index_property
        {
            entity.set(index_property.clone(), Value::Int(owned.index as i64));
        }
        if let (Some(position), Some(version)) = (descriptor.version_position(), version) {
            let field_name = &descriptor.field(position).expect("version position").name;
            entity.set(field_name.clone(), Value::Int(version));
        }

        Ok(entity)
    }

    #[must_use]
    pub fn batch_inserts_active(&self) -> bool {
        self.insert_batch.is_batch_operation()
    }

    #[must_use]
    pub fn batch_deletes_active(&self) -> bool {
        self.delete_batch.is_batch_operation()
    }

    /// Open the insert batch window explicitly; subsequent [`Self::insert`]
    /// calls accumulate until [`Self::finish_batch_inserts`].
    pub fn start_batch_inserts(&mut self) -> Result<(), PersistError> {
        self.insert_batch.start_batch_operation()
    }

    /// Open the delete batch window explicitly.
    pub fn start_batch_deletes(&mut self) -> Result<(), PersistError> {
        self.delete_batch.start_batch_operation()
    }
}
