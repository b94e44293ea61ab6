//! Module: group
//! Responsibility: entity-group resolution — which ancestor key a
//! to-be-persisted object receives, and whether an ownership assignment
//! crosses group boundaries.
//! Does not own: key construction (cascade) or metadata validation (meta).
//!
//! Resolution priority on create:
//! 1. an owning parent cascading this object adopts it into the parent's
//!    group — unless the child explicitly declared a *different* ancestor;
//! 2. the child's own explicitly declared ancestor;
//! 3. no ancestor: the object roots its own entity group.

use crate::{
    error::PersistError,
    key::Key,
    session::{ObjectId, Session},
};

/// Resolve the ancestor key for an object about to be inserted.
pub(crate) fn resolve_ancestor(
    session: &Session<'_>,
    id: ObjectId,
    cascaded_parent: Option<&Key>,
) -> Result<Option<Key>, PersistError> {
    let descriptor = &session.obj(id).descriptor;
    let declared = session.declared_ancestor(id)?;

    if let Some(parent) = cascaded_parent {
        if let Some(explicit) = &declared
            && explicit != parent
        {
            return Err(PersistError::ConflictingAncestor {
                kind: descriptor.kind().to_string(),
                explicit: explicit.to_string(),
                parent: parent.to_string(),
            });
        }
        return Ok(Some(parent.clone()));
    }

    if declared.is_some() {
        return Ok(declared);
    }

    if let Some(position) = descriptor.ancestor_position()
        && descriptor.ancestor_required()
    {
        let field = &descriptor.field(position).expect("ancestor position").name;
        return Err(PersistError::MissingAncestor {
            kind: descriptor.kind().to_string(),
            field: field.clone(),
        });
    }

    Ok(None)
}

/// Verify that an already-persistent object can serve as an owned child of
/// `root`. A persisted key fixes the entity group forever: a parentless key
/// can never gain a parent, and a parented key can never move.
pub(crate) fn check_owned_child(child_key: &Key, root_key: &Key) -> Result<(), PersistError> {
    match child_key.parent() {
        None => Err(PersistError::CrossGroupAssignment {
            child_key: child_key.to_string(),
            parent_key: root_key.to_string(),
            detail: "the object was already persisted without a parent; a parent cannot be established once persisted".to_string(),
        }),
        Some(parent) if parent != root_key => Err(PersistError::CrossGroupAssignment {
            child_key: child_key.to_string(),
            parent_key: root_key.to_string(),
            detail: format!(
                "the object is already a child of {parent}; a parent cannot change once persisted"
            ),
        }),
        Some(_) => Ok(()),
    }
}
