//! Module: key
//! Responsibility: hierarchical entity keys, kind identity, and the encoded
//! string codec.
//! Does not own: key *assignment* policy (session/cascade) or id allocation
//! (sequence).
//!
//! Invariants:
//! - A key carries exactly one identifier form (numeric id or string name).
//! - Parent chains are finite and immutable once constructed.
//! - `decode(encode(k)) == k` for every well-formed key.

pub(crate) mod codec;

use crate::error::PersistError;
use derive_more::Display;
use std::fmt;
use thiserror::Error as ThisError;

pub use codec::{decode_key, encode_key};

pub(crate) const MAX_KIND_LEN: usize = 64;

///
/// KindNameError
/// (construction boundary)
///

#[derive(Debug, ThisError)]
pub enum KindNameError {
    #[error("kind is empty")]
    Empty,

    #[error("kind length {len} exceeds max {max}")]
    TooLong { len: usize, max: usize },

    #[error("kind must be ASCII")]
    NonAscii,
}

///
/// KindName
///
/// Validated entity-kind identity: non-empty ASCII, bounded length.
///

#[derive(Clone, Debug, Display, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct KindName(String);

impl KindName {
    /// Validate and construct a kind name.
    pub fn try_from_str(name: &str) -> Result<Self, KindNameError> {
        if name.is_empty() {
            return Err(KindNameError::Empty);
        }
        if name.len() > MAX_KIND_LEN {
            return Err(KindNameError::TooLong {
                len: name.len(),
                max: MAX_KIND_LEN,
            });
        }
        if !name.is_ascii() {
            return Err(KindNameError::NonAscii);
        }

        Ok(Self(name.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

///
/// KeyId
///
/// The identifier half of a key: a store-assigned numeric id or an
/// application-assigned name. The enum makes "exactly one form" structural.
///

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum KeyId {
    Id(i64),
    Name(String),
}

impl KeyId {
    #[must_use]
    pub const fn id(&self) -> Option<i64> {
        match self {
            Self::Id(id) => Some(*id),
            Self::Name(_) => None,
        }
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Id(_) => None,
            Self::Name(name) => Some(name),
        }
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Name(name) => write!(f, "{name:?}"),
        }
    }
}

///
/// Key
///
/// Immutable hierarchical entity key. The parent chain is the ancestor path;
/// all keys sharing a root ancestor form one entity group.
///

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Key {
    kind: KindName,
    id: KeyId,
    parent: Option<Box<Key>>,
}

impl Key {
    /// Construct a key from a raw kind string, validating the kind.
    pub fn new(kind: &str, id: KeyId, parent: Option<Key>) -> Result<Self, PersistError> {
        let kind = KindName::try_from_str(kind)
            .map_err(|err| PersistError::malformed_key(kind, err.to_string()))?;

        Ok(Self::from_parts(kind, id, parent))
    }

    #[must_use]
    pub fn from_parts(kind: KindName, id: KeyId, parent: Option<Self>) -> Self {
        Self {
            kind,
            id,
            parent: parent.map(Box::new),
        }
    }

    #[must_use]
    pub fn with_id(kind: KindName, id: i64, parent: Option<Self>) -> Self {
        Self::from_parts(kind, KeyId::Id(id), parent)
    }

    #[must_use]
    pub fn with_name(kind: KindName, name: impl Into<String>, parent: Option<Self>) -> Self {
        Self::from_parts(kind, KeyId::Name(name.into()), parent)
    }

    #[must_use]
    pub const fn kind(&self) -> &KindName {
        &self.kind
    }

    #[must_use]
    pub const fn id(&self) -> &KeyId {
        &self.id
    }

    #[must_use]
    pub fn parent(&self) -> Option<&Self> {
        self.parent.as_deref()
    }

    /// The root of this key's ancestor path. A parentless key is its own
    /// entity-group root.
    #[must_use]
    pub fn group_root(&self) -> &Self {
        let mut root = self;
        while let Some(parent) = root.parent() {
            root = parent;
        }
        root
    }

    /// Whether `self` and `other` live in the same entity group.
    #[must_use]
    pub fn same_group(&self, other: &Self) -> bool {
        self.group_root() == other.group_root()
    }

    /// Number of ancestors above this key.
    #[must_use]
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut cursor = self;
        while let Some(parent) = cursor.parent() {
            depth += 1;
            cursor = parent;
        }
        depth
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(parent) = self.parent() {
            write!(f, "{parent}/")?;
        }
        write!(f, "{}({})", self.kind, self.id)
    }
}
