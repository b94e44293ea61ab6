//! Module: meta
//! Responsibility: static per-kind mapping metadata and its registry.
//! Does not own: live object state (session) or mapping execution (mapper).
//!
//! Field positions are stable integers: a field's index in the descriptor's
//! declaration order. All field addressing in the engine goes through this
//! lookup table; there is no reflection.

pub mod relationship;
pub(crate) mod validate;

use crate::{error::PersistError, key::KindName};
use relationship::RelationshipDescriptor;
use std::{collections::BTreeMap, sync::Arc};

///
/// KeyStrategy
///
/// How a kind's key identity is produced.
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum KeyStrategy {
    /// Numeric id allocated from the store's per-kind id space at insert.
    AutoId,
    /// Numeric id served from a named sequence (defaults to the kind's
    /// derived sequence name).
    Sequence { sequence: Option<String> },
    /// Application-assigned string name, supplied through the key-name field
    /// before insert.
    Name,
    /// Full encoded key carried by a key field; the only strategy that can
    /// carry an ancestor path in its identity.
    Encoded,
}

impl KeyStrategy {
    #[must_use]
    pub const fn is_numeric(&self) -> bool {
        matches!(self, Self::AutoId | Self::Sequence { .. })
    }
}

///
/// ScalarKind
///
/// Declared scalar field types. Narrow integers widen to `Int` on the wire
/// and narrow back on read.
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ScalarKind {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Float,
    Text,
    Timestamp,
    KeyRef,
    Enum(Vec<String>),
}

///
/// ContainerKind
///
/// Shape of a scalar-collection field. Ordered containers preserve store
/// order on read; `Set` re-buckets (de-duplicates, first occurrence wins).
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ContainerKind {
    List,
    Set,
    Array,
}

///
/// FieldKind
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FieldKind {
    Scalar(ScalarKind),
    /// Length-capped byte sequence ("short blob").
    ShortBlob { cap: usize },
    Blob,
    Collection {
        element: ScalarKind,
        container: ContainerKind,
    },
    Embedded {
        descriptor: Arc<EmbeddedDescriptor>,
        prefix: Option<String>,
    },
    /// Write-once ancestor identity; `required` makes a missing ancestor on
    /// create a hard error.
    KeyAncestor { required: bool },
    /// Companion field receiving the numeric id of the assigned key.
    KeyId,
    /// Key-name field: source of the name for `KeyStrategy::Name`, write-back
    /// target otherwise.
    KeyName,
    /// Encoded-key field: may supply the full identity (including ancestor)
    /// before insert; receives the encoded assigned key afterwards.
    KeyEncoded,
    /// Engine-managed optimistic version counter.
    Version,
    Relationship(RelationshipDescriptor),
}

///
/// FieldDescriptor
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FieldDescriptor {
    pub name: String,
    pub kind: FieldKind,
}

impl FieldDescriptor {
    #[must_use]
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    #[must_use]
    pub fn scalar(name: impl Into<String>, scalar: ScalarKind) -> Self {
        Self::new(name, FieldKind::Scalar(scalar))
    }

    #[must_use]
    pub fn short_blob(name: impl Into<String>, cap: usize) -> Self {
        Self::new(name, FieldKind::ShortBlob { cap })
    }

    #[must_use]
    pub fn blob(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Blob)
    }

    #[must_use]
    pub fn collection(
        name: impl Into<String>,
        element: ScalarKind,
        container: ContainerKind,
    ) -> Self {
        Self::new(name, FieldKind::Collection { element, container })
    }

    #[must_use]
    pub fn embedded(
        name: impl Into<String>,
        descriptor: Arc<EmbeddedDescriptor>,
        prefix: Option<&str>,
    ) -> Self {
        Self::new(
            name,
            FieldKind::Embedded {
                descriptor,
                prefix: prefix.map(str::to_string),
            },
        )
    }

    #[must_use]
    pub fn ancestor(name: impl Into<String>, required: bool) -> Self {
        Self::new(name, FieldKind::KeyAncestor { required })
    }

    #[must_use]
    pub fn key_id(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::KeyId)
    }

    #[must_use]
    pub fn key_name(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::KeyName)
    }

    #[must_use]
    pub fn key_encoded(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::KeyEncoded)
    }

    #[must_use]
    pub fn version(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Version)
    }

    #[must_use]
    pub fn relationship(name: impl Into<String>, descriptor: RelationshipDescriptor) -> Self {
        Self::new(name, FieldKind::Relationship(descriptor))
    }

    #[must_use]
    pub const fn relationship_descriptor(&self) -> Option<&RelationshipDescriptor> {
        match &self.kind {
            FieldKind::Relationship(rel) => Some(rel),
            _ => None,
        }
    }
}

///
/// EmbeddedDescriptor
///
/// Field layout of a nested, non-entity object. Leaves flatten into the
/// owner's property bag; only value-shaped fields are allowed inside.
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EmbeddedDescriptor {
    pub fields: Vec<FieldDescriptor>,
}

impl EmbeddedDescriptor {
    #[must_use]
    pub fn new(fields: Vec<FieldDescriptor>) -> Arc<Self> {
        Arc::new(Self { fields })
    }
}

///
/// EntityDescriptor
///
/// Complete static metadata for one kind: key strategy plus fields in
/// declaration order. Declaration order defines the stable field positions.
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EntityDescriptor {
    kind: KindName,
    strategy: KeyStrategy,
    fields: Vec<FieldDescriptor>,
}

impl EntityDescriptor {
    #[must_use]
    pub const fn new(kind: KindName, strategy: KeyStrategy) -> Self {
        Self {
            kind,
            strategy,
            fields: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }

    #[must_use]
    pub const fn kind(&self) -> &KindName {
        &self.kind
    }

    #[must_use]
    pub const fn strategy(&self) -> &KeyStrategy {
        &self.strategy
    }

    #[must_use]
    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    /// Stable position of a field, the engine's only field-addressing path.
    #[must_use]
    pub fn field_position(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    #[must_use]
    pub fn field(&self, position: usize) -> Option<&FieldDescriptor> {
        self.fields.get(position)
    }

    /// Store-side sequence identity for `KeyStrategy::Sequence`.
    #[must_use]
    pub fn sequence_name(&self) -> Option<String> {
        match &self.strategy {
            KeyStrategy::Sequence { sequence } => Some(
                sequence
                    .clone()
                    .unwrap_or_else(|| format!("{}_SEQUENCE__", self.kind)),
            ),
            _ => None,
        }
    }

    pub(crate) fn position_of_kind(
        &self,
        probe: impl Fn(&FieldKind) -> bool,
    ) -> Option<usize> {
        self.fields.iter().position(|f| probe(&f.kind))
    }

    pub(crate) fn ancestor_position(&self) -> Option<usize> {
        self.position_of_kind(|k| matches!(k, FieldKind::KeyAncestor { .. }))
    }

    pub(crate) fn ancestor_required(&self) -> bool {
        self.fields
            .iter()
            .any(|f| matches!(f.kind, FieldKind::KeyAncestor { required: true }))
    }

    pub(crate) fn key_id_position(&self) -> Option<usize> {
        self.position_of_kind(|k| matches!(k, FieldKind::KeyId))
    }

    pub(crate) fn key_name_position(&self) -> Option<usize> {
        self.position_of_kind(|k| matches!(k, FieldKind::KeyName))
    }

    pub(crate) fn key_encoded_position(&self) -> Option<usize> {
        self.position_of_kind(|k| matches!(k, FieldKind::KeyEncoded))
    }

    pub(crate) fn version_position(&self) -> Option<usize> {
        self.position_of_kind(|k| matches!(k, FieldKind::Version))
    }

    pub(crate) fn relationship_positions(
        &self,
    ) -> impl Iterator<Item = (usize, &FieldDescriptor, &RelationshipDescriptor)> {
        self.fields.iter().enumerate().filter_map(|(i, f)| {
            f.relationship_descriptor().map(|rel| (i, f, rel))
        })
    }
}

///
/// MetadataRegistry
///
/// Process-wide descriptor table. Registration validates once; a rejected
/// descriptor never enters the table, so the misconfiguration resurfaces on
/// every use.
///

#[derive(Debug, Default)]
pub(crate) struct MetadataRegistry {
    descriptors: BTreeMap<KindName, Arc<EntityDescriptor>>,
}

impl MetadataRegistry {
    pub fn register(
        &mut self,
        descriptor: EntityDescriptor,
    ) -> Result<Arc<EntityDescriptor>, PersistError> {
        validate::validate_descriptor(&descriptor)?;

        if self.descriptors.contains_key(descriptor.kind()) {
            return Err(PersistError::metadata(
                descriptor.kind(),
                "kind is already registered",
            ));
        }

        let descriptor = Arc::new(descriptor);
        self.descriptors
            .insert(descriptor.kind().clone(), Arc::clone(&descriptor));

        Ok(descriptor)
    }

    pub fn get(&self, kind: &KindName) -> Option<Arc<EntityDescriptor>> {
        self.descriptors.get(kind).map(Arc::clone)
    }

    pub fn expect(&self, kind: &KindName) -> Result<Arc<EntityDescriptor>, PersistError> {
        self.get(kind).ok_or_else(|| {
            PersistError::illegal_state(format!("kind {kind} is not registered"))
        })
    }
}
