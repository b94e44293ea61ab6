//! Kindred — an object-mapping and persistence-cascade runtime for
//! hierarchically keyed datastores.
//!
//! ## Crate layout
//! - `core`: the engine — keys, values, metadata, sessions, cascades,
//!   batching, and the concurrency guard.
//!
//! The `prelude` module mirrors the runtime surface used by application
//! code; store-client and observability types are reached through `core`.

pub use kindred_core as core;

/// Workspace version re-export for downstream tooling/tests.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

///
/// Prelude
/// using _ brings traits into scope and avoids name conflicts
///

pub mod prelude {
    pub use crate::core::prelude::*;
    pub use crate::core::{
        config::EngineConfig,
        store::{IdRange, Store, StoreFault, TxnHandle},
    };
}
