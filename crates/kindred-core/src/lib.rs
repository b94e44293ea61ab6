//! Core runtime for Kindred: the object-mapping and persistence-cascade
//! engine over a hierarchically keyed, flat key-value store.
//!
//! The engine reconciles a graph-shaped domain model with flat entities:
//! keys form ancestor paths, related objects sharing a transaction must
//! share one entity group, and insert/update/delete cascades keep child
//! ordering and back-references consistent while batching store calls and
//! surfacing optimistic-concurrency collisions.
#![warn(unreachable_pub)]

pub mod batch;
pub mod config;
pub mod entity;
pub mod error;
pub mod key;
pub mod meta;
pub mod obs;
pub mod sequence;
pub mod session;
pub mod store;
pub mod types;
pub mod value;

pub(crate) mod cascade;
pub(crate) mod group;
pub(crate) mod mapper;
pub(crate) mod txn;

// test
#[cfg(test)]
pub(crate) mod test_support;

///
/// Prelude
///
/// Domain vocabulary only. Store traits, config, and observability surfaces
/// are imported from their modules explicitly.
///

pub mod prelude {
    pub use crate::{
        entity::{Entity, Properties},
        error::PersistError,
        key::{Key, KeyId, KindName, decode_key, encode_key},
        meta::{
            ContainerKind, EmbeddedDescriptor, EntityDescriptor, FieldDescriptor, FieldKind,
            KeyStrategy, ScalarKind,
            relationship::{
                Cardinality, CascadePolicy, Direction, OrderingPolicy, RelationContainer,
                RelationshipDescriptor,
            },
        },
        session::{DetachedObject, Engine, LifecycleState, ObjectId, ObjectRef, Session},
        types::{Float64, Timestamp},
        value::Value,
    };
}
