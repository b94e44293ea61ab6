use std::fmt;
use thiserror::Error as ThisError;

///
/// PersistError
///
/// Flat, structured runtime error for the persistence engine.
/// One variant per user-visible failure kind; context (kind/key/field) is
/// carried as data so callers never have to re-derive it.
///

#[remain::sorted]
#[derive(Clone, Debug, Eq, PartialEq, ThisError)]
pub enum PersistError {
    /// The store reported an optimistic-concurrency collision.
    ///
    /// `completed` counts the entity operations of the same flush that had
    /// already been issued successfully before the collision; they are never
    /// reported as failed.
    #[error(
        "concurrent modification on {kind} {key} ({completed} earlier operation(s) in this flush completed)"
    )]
    ConcurrentModification {
        kind: String,
        key: String,
        completed: usize,
    },

    /// A cascaded child already carries an explicit ancestor different from
    /// the owning parent's key.
    #[error(
        "conflicting ancestor for {kind}: explicit ancestor {explicit} differs from owning parent {parent}"
    )]
    ConflictingAncestor {
        kind: String,
        explicit: String,
        parent: String,
    },

    /// A persistent object was assigned as an owned child of a root in a
    /// different entity group.
    #[error("cannot make {child_key} a child of {parent_key}: {detail}")]
    CrossGroupAssignment {
        child_key: String,
        parent_key: String,
        detail: String,
    },

    /// An operation was invoked in a state that does not permit it.
    #[error("illegal state: {message}")]
    IllegalState { message: String },

    /// A non-null value was written to an ancestor field after the object's
    /// key (and therefore its entity group) was fixed.
    #[error("ancestor of {kind} is immutable once persisted (field {field})")]
    ImmutableAncestor { kind: String, field: String },

    /// An encoded key string failed to decode.
    #[error("malformed key '{input}': {reason}")]
    MalformedKey { input: String, reason: String },

    /// A field value could not be mapped to or from its property form.
    #[error("mapping failure on {kind}.{field}: {message}")]
    Mapping {
        kind: String,
        field: String,
        message: String,
    },

    /// Static metadata for a kind is misconfigured. Fatal; detected once at
    /// registration and never retried.
    #[error("invalid metadata for {kind}: {message}")]
    MetadataValidation { kind: String, message: String },

    /// A mandatory ancestor was absent on a create request.
    #[error("missing ancestor for {kind} (field {field})")]
    MissingAncestor { kind: String, field: String },

    /// A transactional batch spanned more than one entity group.
    #[error("transaction spans entity groups {first} and {second}; a transaction is limited to one group")]
    MultiGroupTransaction { first: String, second: String },

    /// The store had no entity for the requested key. Propagated, never
    /// generated locally.
    #[error("entity not found: {key}")]
    NotFound { key: String },

    /// Any other store-reported fault, carried as structured cause data.
    #[error("store fault during {operation}: {message}")]
    Store { operation: String, message: String },
}

impl PersistError {
    /// Construct an illegal-state error.
    pub(crate) fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState {
            message: message.into(),
        }
    }

    /// Construct a mapping error with field context.
    pub(crate) fn mapping(
        kind: impl fmt::Display,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Mapping {
            kind: kind.to_string(),
            field: field.into(),
            message: message.into(),
        }
    }

    /// Construct a metadata validation error.
    pub(crate) fn metadata(kind: impl fmt::Display, message: impl Into<String>) -> Self {
        Self::MetadataValidation {
            kind: kind.to_string(),
            message: message.into(),
        }
    }

    /// Construct a malformed-key error, truncating oversized inputs so the
    /// error itself stays bounded.
    pub(crate) fn malformed_key(input: &str, reason: impl Into<String>) -> Self {
        const MAX_ECHOED_INPUT: usize = 128;

        let input = if input.len() > MAX_ECHOED_INPUT {
            format!("{}…", &input[..MAX_ECHOED_INPUT])
        } else {
            input.to_string()
        };

        Self::MalformedKey {
            input,
            reason: reason.into(),
        }
    }

    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    #[must_use]
    pub const fn is_concurrent_modification(&self) -> bool {
        matches!(self, Self::ConcurrentModification { .. })
    }
}
