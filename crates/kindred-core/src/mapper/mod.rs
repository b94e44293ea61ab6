//! Module: mapper
//! Responsibility: converting one object's fields to and from entity
//! properties, one declared field at a time, addressed by stable position.
//! Does not own: key assignment, cascade traversal, or store calls.
//!
//! Invariants:
//! - Presence is explicit: every mapped field contributes its property, with
//!   `Null` for "no value".
//! - Embedded objects flatten to leaf properties; a null embedded field
//!   still emits every leaf as `Null`.
//! - Narrow integers travel wide and are range-checked both ways.

pub(crate) mod convert;

use crate::{
    entity::{Entity, Properties},
    error::PersistError,
    key::{KindName, encode_key},
    meta::{EmbeddedDescriptor, EntityDescriptor, FieldKind, relationship::Cardinality},
    session::{ManagedObject, ObjectId, ObjectRef, Slot},
    value::Value,
};
use std::sync::Arc;

///
/// Write path
///

/// Map an object's fields into its property bag. `objects` is the session
/// arena, needed to resolve attached references to their keys; every
/// referenced object must already carry a key.
pub(crate) fn to_properties(
    objects: &[ManagedObject],
    id: ObjectId,
) -> Result<Properties, PersistError> {
    let object = &objects[id.index()];
    let descriptor = &object.descriptor;
    let kind = descriptor.kind();
    let mut out = Properties::new();

    for (position, field) in descriptor.fields().iter().enumerate() {
        let slot = &object.slots[position];
        match &field.kind {
            FieldKind::Scalar(scalar) => {
                let value = expect_value(kind, &field.name, slot)?;
                convert::check_scalar(kind, &field.name, scalar, value)?;
                out.set(&field.name, value.clone());
            }
            FieldKind::ShortBlob { cap } => {
                let value = expect_value(kind, &field.name, slot)?;
                if let Value::Blob(bytes) = value
                    && bytes.len() > *cap
                {
                    return Err(PersistError::mapping(
                        kind,
                        &field.name,
                        format!("{} bytes exceed the short blob cap of {cap}", bytes.len()),
                    ));
                }
                out.set(&field.name, value.clone());
            }
            FieldKind::Blob => {
                let value = expect_value(kind, &field.name, slot)?;
                out.set(&field.name, value.clone());
            }
            FieldKind::Collection { element, .. } => {
                let value = expect_value(kind, &field.name, slot)?;
                if let Value::List(items) = value {
                    for item in items {
                        convert::check_scalar(kind, &field.name, element, item)?;
                    }
                }
                out.set(&field.name, value.clone());
            }
            FieldKind::Embedded {
                descriptor: embedded,
                prefix,
            } => {
                let Slot::Embedded(record) = slot else {
                    return Err(PersistError::mapping(
                        kind,
                        &field.name,
                        "embedded slot shape mismatch",
                    ));
                };
                flatten_embedded(
                    kind,
                    embedded,
                    prefix.as_deref(),
                    record.as_deref(),
                    &mut out,
                )?;
            }
            // Key identity travels in the key, not the property bag. The
            // version property is stamped by the flush path, which owns the
            // increment decision.
            FieldKind::KeyAncestor { .. }
            | FieldKind::KeyId
            | FieldKind::KeyName
            | FieldKind::KeyEncoded
            | FieldKind::Version => {}
            // One-to-many children carry the relationship on their side
            // (back reference and ordering index); the owner's entity stores
            // nothing for the collection itself. Single references become a
            // key property.
            FieldKind::Relationship(_) => {
                if let Slot::Reference(target) = slot {
                    let value = match target {
                        None => Value::Null,
                        Some(ObjectRef::Key(key)) => Value::Key(key.clone()),
                        Some(ObjectRef::Attached(child)) => {
                            let child_key =
                                objects[child.index()].key.clone().ok_or_else(|| {
                                    PersistError::mapping(
                                        kind,
                                        &field.name,
                                        "referenced object has no key yet",
                                    )
                                })?;
                            Value::Key(child_key)
                        }
                    };
                    out.set(&field.name, value);
                }
            }
        }
    }

    Ok(out)
}

// Emit every leaf of an embedded record, with nulls for an absent record so
// partial re-embedding and per-leaf queries keep working.
fn flatten_embedded(
    kind: &KindName,
    embedded: &Arc<EmbeddedDescriptor>,
    prefix: Option<&str>,
    record: Option<&[Slot]>,
    out: &mut Properties,
) -> Result<(), PersistError> {
    for (position, leaf) in embedded.fields.iter().enumerate() {
        let name = prefixed(prefix, &leaf.name);
        let slot = record.map(|slots| &slots[position]);

        match &leaf.kind {
            FieldKind::Embedded {
                descriptor: nested,
                prefix: nested_prefix,
            } => {
                let nested_record = match slot {
                    Some(Slot::Embedded(record)) => record.as_deref(),
                    _ => None,
                };
                let composed = compose_prefix(prefix, nested_prefix.as_deref());
                flatten_embedded(kind, nested, composed.as_deref(), nested_record, out)?;
            }
            FieldKind::Scalar(scalar) => {
                let value = match slot {
                    Some(Slot::Value(value)) => {
                        convert::check_scalar(kind, &leaf.name, scalar, value)?;
                        value.clone()
                    }
                    _ => Value::Null,
                };
                out.set(name, value);
            }
            _ => {
                let value = match slot {
                    Some(Slot::Value(value)) => value.clone(),
                    _ => Value::Null,
                };
                out.set(name, value);
            }
        }
    }

    Ok(())
}

///
/// Read path
///

/// Rebuild field slots from a stored entity. Collection relationships attach
/// empty (their elements are separate entities); single references attach as
/// bare keys.
pub(crate) fn apply_properties(
    descriptor: &Arc<EntityDescriptor>,
    entity: &Entity,
) -> Result<Vec<Slot>, PersistError> {
    let kind = descriptor.kind();
    let mut slots = Vec::with_capacity(descriptor.fields().len());

    for field in descriptor.fields() {
        let slot = match &field.kind {
            FieldKind::Scalar(scalar) => {
                let value = entity.get(&field.name).cloned().unwrap_or(Value::Null);
                convert::check_stored_scalar(kind, &field.name, scalar, &value)?;
                Slot::Value(value)
            }
            FieldKind::ShortBlob { cap } => {
                let value = entity.get(&field.name).cloned().unwrap_or(Value::Null);
                match &value {
                    Value::Null | Value::Blob(_) => {}
                    other => {
                        return Err(PersistError::mapping(
                            kind,
                            &field.name,
                            format!("stored value is {}, expected blob", other.tag()),
                        ));
                    }
                }
                if let Value::Blob(bytes) = &value
                    && bytes.len() > *cap
                {
                    return Err(PersistError::mapping(
                        kind,
                        &field.name,
                        format!(
                            "stored blob of {} bytes exceeds the declared cap of {cap}",
                            bytes.len()
                        ),
                    ));
                }
                Slot::Value(value)
            }
            FieldKind::Blob => {
                let value = entity.get(&field.name).cloned().unwrap_or(Value::Null);
                if !matches!(value, Value::Null | Value::Blob(_)) {
                    return Err(PersistError::mapping(
                        kind,
                        &field.name,
                        format!("stored value is {}, expected blob", value.tag()),
                    ));
                }
                Slot::Value(value)
            }
            FieldKind::Collection { element, container } => {
                match entity.get(&field.name).cloned() {
                    None | Some(Value::Null) => Slot::Value(Value::Null),
                    Some(Value::List(items)) => {
                        for item in &items {
                            convert::check_stored_scalar(kind, &field.name, element, item)?;
                        }
                        Slot::Value(Value::List(convert::rebucket(*container, items)))
                    }
                    Some(other) => {
                        return Err(PersistError::mapping(
                            kind,
                            &field.name,
                            format!("stored value is {}, expected list", other.tag()),
                        ));
                    }
                }
            }
            FieldKind::Embedded {
                descriptor: embedded,
                prefix,
            } => Slot::Embedded(Some(read_embedded(
                kind,
                embedded,
                prefix.as_deref(),
                entity,
            )?)),
            FieldKind::KeyAncestor { .. } => Slot::Value(
                entity
                    .key()
                    .parent()
                    .map_or(Value::Null, |p| Value::Key(p.clone())),
            ),
            FieldKind::KeyId => Slot::Value(
                entity
                    .key()
                    .id()
                    .id()
                    .map_or(Value::Null, Value::Int),
            ),
            FieldKind::KeyName => Slot::Value(
                entity
                    .key()
                    .id()
                    .name()
                    .map_or(Value::Null, |n| Value::Text(n.to_string())),
            ),
            FieldKind::KeyEncoded => Slot::Value(Value::Text(encode_key(entity.key()))),
            FieldKind::Version => {
                Slot::Value(entity.get(&field.name).cloned().unwrap_or(Value::Null))
            }
            FieldKind::Relationship(rel) => match rel.cardinality {
                Cardinality::OneToOne => match entity.get(&field.name) {
                    Some(Value::Key(key)) => Slot::Reference(Some(ObjectRef::Key(key.clone()))),
                    _ => Slot::Reference(None),
                },
                Cardinality::OneToMany => Slot::Collection(Vec::new()),
            },
        };
        slots.push(slot);
    }

    Ok(slots)
}

// A null embedded field reads back as a materialized record of null leaves;
// the flat store cannot distinguish the two shapes.
fn read_embedded(
    kind: &KindName,
    embedded: &Arc<EmbeddedDescriptor>,
    prefix: Option<&str>,
    entity: &Entity,
) -> Result<Vec<Slot>, PersistError> {
    let mut slots = Vec::with_capacity(embedded.fields.len());

    for leaf in &embedded.fields {
        let name = prefixed(prefix, &leaf.name);
        let slot = match &leaf.kind {
            FieldKind::Embedded {
                descriptor: nested,
                prefix: nested_prefix,
            } => {
                let composed = compose_prefix(prefix, nested_prefix.as_deref());
                Slot::Embedded(Some(read_embedded(
                    kind,
                    nested,
                    composed.as_deref(),
                    entity,
                )?))
            }
            FieldKind::Scalar(scalar) => {
                let value = entity.get(&name).cloned().unwrap_or(Value::Null);
                convert::check_stored_scalar(kind, &leaf.name, scalar, &value)?;
                Slot::Value(value)
            }
            FieldKind::Collection { element, container } => match entity.get(&name).cloned() {
                None | Some(Value::Null) => Slot::Value(Value::Null),
                Some(Value::List(items)) => {
                    for item in &items {
                        convert::check_stored_scalar(kind, &leaf.name, element, item)?;
                    }
                    Slot::Value(Value::List(convert::rebucket(*container, items)))
                }
                Some(other) => {
                    return Err(PersistError::mapping(
                        kind,
                        &leaf.name,
                        format!("stored value is {}, expected list", other.tag()),
                    ));
                }
            },
            _ => Slot::Value(entity.get(&name).cloned().unwrap_or(Value::Null)),
        };
        slots.push(slot);
    }

    Ok(slots)
}

fn prefixed(prefix: Option<&str>, name: &str) -> String {
    match prefix {
        Some(prefix) => format!("{prefix}{name}"),
        None => name.to_string(),
    }
}

fn compose_prefix(outer: Option<&str>, inner: Option<&str>) -> Option<String> {
    match (outer, inner) {
        (None, None) => None,
        (Some(outer), None) => Some(outer.to_string()),
        (None, Some(inner)) => Some(inner.to_string()),
        (Some(outer), Some(inner)) => Some(format!("{outer}{inner}")),
    }
}

fn expect_value<'a>(
    kind: &KindName,
    field: &str,
    slot: &'a Slot,
) -> Result<&'a Value, PersistError> {
    match slot {
        Slot::Value(value) => Ok(value),
        _ => Err(PersistError::mapping(kind, field, "value slot shape mismatch")),
    }
}
