//! Registration-time metadata validation.
//!
//! Every rule here is fatal: a descriptor that fails validation is never
//! registered, and the same error surfaces on each attempt to use the kind.

use crate::{
    error::PersistError,
    meta::{
        EmbeddedDescriptor, EntityDescriptor, FieldKind, KeyStrategy, ScalarKind,
        relationship::{Cardinality, OrderingPolicy, RelationContainer},
    },
};
use std::collections::BTreeSet;

pub(crate) fn validate_descriptor(descriptor: &EntityDescriptor) -> Result<(), PersistError> {
    let kind = descriptor.kind();

    // Phase 1: field-name uniqueness.
    let mut seen = BTreeSet::new();
    for field in descriptor.fields() {
        if !seen.insert(field.name.as_str()) {
            return Err(PersistError::metadata(
                kind,
                format!("duplicate field '{}'", field.name),
            ));
        }
    }

    // Phase 2: key-field shape.
    let ancestors: Vec<&str> = fields_of(descriptor, |k| {
        matches!(k, FieldKind::KeyAncestor { .. })
    });
    if ancestors.len() > 1 {
        return Err(PersistError::metadata(
            kind,
            format!(
                "declares {} ancestor fields ({}); at most one is allowed",
                ancestors.len(),
                ancestors.join(", ")
            ),
        ));
    }
    if !ancestors.is_empty() && !matches!(descriptor.strategy(), KeyStrategy::Encoded) {
        return Err(PersistError::metadata(
            kind,
            format!(
                "ancestor field '{}' requires an encoded key identity; a plain id or name key cannot carry an ancestor path",
                ancestors[0]
            ),
        ));
    }

    let unique_roles: [fn(&FieldKind) -> bool; 4] = [
        |k| matches!(k, FieldKind::KeyId),
        |k| matches!(k, FieldKind::KeyName),
        |k| matches!(k, FieldKind::KeyEncoded),
        |k| matches!(k, FieldKind::Version),
    ];
    for probe in unique_roles {
        let matched = fields_of(descriptor, probe);
        if matched.len() > 1 {
            return Err(PersistError::metadata(
                kind,
                format!(
                    "conflicting key designations: fields {} claim the same key role",
                    matched.join(", ")
                ),
            ));
        }
    }

    let has_encoded = descriptor.key_encoded_position().is_some();
    if has_encoded
        && (descriptor.key_id_position().is_some() || descriptor.key_name_position().is_some())
    {
        return Err(PersistError::metadata(
            kind,
            "a key field cannot be marked encoded and id/name at the same time",
        ));
    }

    match descriptor.strategy() {
        KeyStrategy::Name if descriptor.key_name_position().is_none() => {
            return Err(PersistError::metadata(
                kind,
                "name key identity requires a key-name field",
            ));
        }
        KeyStrategy::AutoId | KeyStrategy::Sequence { .. }
            if descriptor.key_name_position().is_some() =>
        {
            return Err(PersistError::metadata(
                kind,
                "a numeric key identity cannot carry a key-name field",
            ));
        }
        _ => {}
    }

    // Phase 3: per-field shape.
    for field in descriptor.fields() {
        match &field.kind {
            FieldKind::ShortBlob { cap } if *cap == 0 => {
                return Err(PersistError::metadata(
                    kind,
                    format!("short blob field '{}' has a zero cap", field.name),
                ));
            }
            FieldKind::Scalar(ScalarKind::Enum(variants))
            | FieldKind::Collection {
                element: ScalarKind::Enum(variants),
                ..
            } if variants.is_empty() => {
                return Err(PersistError::metadata(
                    kind,
                    format!("enum field '{}' declares no variants", field.name),
                ));
            }
            FieldKind::Embedded { descriptor: embedded, .. } => {
                validate_embedded(kind, &field.name, embedded)?;
            }
            FieldKind::Relationship(rel) => {
                let single = matches!(rel.container, RelationContainer::Single);
                match rel.cardinality {
                    Cardinality::OneToOne if !single => {
                        return Err(PersistError::metadata(
                            kind,
                            format!(
                                "one-to-one field '{}' must use a single-reference container",
                                field.name
                            ),
                        ));
                    }
                    Cardinality::OneToMany if single => {
                        return Err(PersistError::metadata(
                            kind,
                            format!(
                                "one-to-many field '{}' cannot use a single-reference container",
                                field.name
                            ),
                        ));
                    }
                    _ => {}
                }
                if let OrderingPolicy::Explicit { field: index } = &rel.ordering
                    && index.is_empty()
                {
                    return Err(PersistError::metadata(
                        kind,
                        format!("field '{}' names an empty ordering field", field.name),
                    ));
                }
            }
            _ => {}
        }
    }

    Ok(())
}

// Embedded objects flatten into the owner's property bag, so only
// value-shaped fields can appear inside them.
fn validate_embedded(
    kind: &crate::key::KindName,
    owner_field: &str,
    embedded: &EmbeddedDescriptor,
) -> Result<(), PersistError> {
    let mut seen = BTreeSet::new();
    for field in &embedded.fields {
        if !seen.insert(field.name.as_str()) {
            return Err(PersistError::metadata(
                kind,
                format!(
                    "embedded field '{owner_field}' repeats leaf '{}'",
                    field.name
                ),
            ));
        }
        match &field.kind {
            FieldKind::Scalar(_)
            | FieldKind::ShortBlob { .. }
            | FieldKind::Blob
            | FieldKind::Collection { .. } => {}
            FieldKind::Embedded { descriptor, .. } => {
                validate_embedded(kind, &field.name, descriptor)?;
            }
            _ => {
                return Err(PersistError::metadata(
                    kind,
                    format!(
                        "embedded field '{owner_field}' may only contain value fields (leaf '{}')",
                        field.name
                    ),
                ));
            }
        }
    }

    Ok(())
}

fn fields_of<'a>(
    descriptor: &'a EntityDescriptor,
    probe: impl Fn(&FieldKind) -> bool,
) -> Vec<&'a str> {
    descriptor
        .fields()
        .iter()
        .filter(|f| probe(&f.kind))
        .map(|f| f.name.as_str())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        key::KindName,
        meta::{FieldDescriptor, relationship::RelationshipDescriptor},
    };

    fn kind(name: &str) -> KindName {
        KindName::try_from_str(name).expect("valid kind")
    }

    #[test]
    fn rejects_two_ancestor_fields() {
        let descriptor = EntityDescriptor::new(kind("Child"), KeyStrategy::Encoded)
            .with_field(FieldDescriptor::key_encoded("key"))
            .with_field(FieldDescriptor::ancestor("parent_a", false))
            .with_field(FieldDescriptor::ancestor("parent_b", false));

        let err = validate_descriptor(&descriptor).unwrap_err();
        assert!(matches!(err, PersistError::MetadataValidation { .. }));
        assert!(err.to_string().contains("2 ancestor fields"));
    }

    #[test]
    fn rejects_ancestor_with_plain_numeric_identity() {
        let descriptor = EntityDescriptor::new(kind("Child"), KeyStrategy::AutoId)
            .with_field(FieldDescriptor::ancestor("parent", false));

        let err = validate_descriptor(&descriptor).unwrap_err();
        assert!(err.to_string().contains("encoded key identity"));
    }

    #[test]
    fn rejects_conflicting_key_designations() {
        let descriptor = EntityDescriptor::new(kind("Thing"), KeyStrategy::Encoded)
            .with_field(FieldDescriptor::key_encoded("key"))
            .with_field(FieldDescriptor::key_id("id"));

        let err = validate_descriptor(&descriptor).unwrap_err();
        assert!(err.to_string().contains("encoded and id/name"));
    }

    #[test]
    fn rejects_name_strategy_without_name_field() {
        let descriptor = EntityDescriptor::new(kind("Thing"), KeyStrategy::Name);

        assert!(validate_descriptor(&descriptor).is_err());
    }

    #[test]
    fn rejects_relationship_container_mismatch() {
        let descriptor = EntityDescriptor::new(kind("Root"), KeyStrategy::AutoId).with_field(
            FieldDescriptor::relationship(
                "children",
                RelationshipDescriptor::one_to_many(kind("Child"))
                    .container(RelationContainer::Single),
            ),
        );

        assert!(validate_descriptor(&descriptor).is_err());
    }

    #[test]
    fn rejects_entity_fields_inside_embedded() {
        let embedded = EmbeddedDescriptor::new(vec![FieldDescriptor::key_id("id")]);
        let descriptor = EntityDescriptor::new(kind("Owner"), KeyStrategy::AutoId)
            .with_field(FieldDescriptor::embedded("address", embedded, None));

        let err = validate_descriptor(&descriptor).unwrap_err();
        assert!(err.to_string().contains("value fields"));
    }

    #[test]
    fn accepts_a_complete_descriptor() {
        let descriptor = EntityDescriptor::new(kind("Album"), KeyStrategy::Sequence {
            sequence: None,
        })
        .with_field(FieldDescriptor::key_id("id"))
        .with_field(FieldDescriptor::scalar("title", ScalarKind::Text))
        .with_field(FieldDescriptor::version("revision"))
        .with_field(FieldDescriptor::relationship(
            "tracks",
            RelationshipDescriptor::one_to_many(kind("Track")).bidirectional("album"),
        ));

        assert!(validate_descriptor(&descriptor).is_ok());
    }
}
