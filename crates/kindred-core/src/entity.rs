//! Module: entity
//! Responsibility: the flat entity form written to and read from the store.
//! Does not own: mapping policy (mapper) or key assignment (session).
//!
//! Invariants:
//! - Properties are insertion-ordered and unique by name.
//! - Presence is explicit: a `Null` value is a present property.

use crate::{key::Key, value::Value};
use derive_more::IntoIterator;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

///
/// Properties
///
/// Insertion-ordered property bag. Property counts are small, so lookups are
/// linear scans over the backing vector.
///

#[derive(Clone, Debug, Default, Deserialize, Eq, IntoIterator, PartialEq, Serialize)]
pub struct Properties(#[into_iterator(owned, ref)] Vec<(String, Value)>);

impl Properties {
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Set a property, replacing an existing value in place or appending in
    /// insertion order.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        if let Some(slot) = self.0.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        } else {
            self.0.push((name, value));
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|(n, _)| n == name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let index = self.0.iter().position(|(n, _)| n == name)?;
        Some(self.0.remove(index).1)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v))
    }
}

///
/// Entity
///
/// One flat store record: a complete key plus its property bag.
///

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Entity {
    key: Key,
    properties: Properties,
}

impl Entity {
    #[must_use]
    pub const fn new(key: Key) -> Self {
        Self {
            key,
            properties: Properties::new(),
        }
    }

    #[must_use]
    pub fn with_properties(key: Key, properties: Properties) -> Self {
        Self { key, properties }
    }

    #[must_use]
    pub const fn key(&self) -> &Key {
        &self.key
    }

    #[must_use]
    pub const fn properties(&self) -> &Properties {
        &self.properties
    }

    pub const fn properties_mut(&mut self) -> &mut Properties {
        &mut self.properties
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.properties.set(name, value);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }
}

impl Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} properties)", self.key, self.properties.len())
    }
}
