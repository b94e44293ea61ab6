//! Module: sequence
//! Responsibility: serving unique numeric ids from store-allocated ranges.
//! Does not own: key construction (session/cascade) or the allocation RPC
//! itself (store).
//!
//! Invariants:
//! - Every fetch is a fresh range from the store; a cached range is private
//!   to this allocator instance and never shared or reconstructed.
//! - Ids from one identity are served monotonically within a range, and
//!   ranges never overlap, so two allocators over the same named sequence
//!   can never hand out the same id.

use crate::{
    config::EngineConfig,
    error::PersistError,
    key::KindName,
    obs::sink::{self, MetricsEvent},
    store::Store,
};
use std::collections::BTreeMap;

///
/// SequenceIdentity
///
/// Which id space an allocation draws from: the per-kind auto-increment
/// space, or a named sequence. The two spaces overlap store-side, so a kind
/// must use one or the other consistently.
///

#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum SequenceIdentity {
    Kind(KindName),
    Named(String),
}

impl SequenceIdentity {
    fn store_name(&self) -> &str {
        match self {
            Self::Kind(kind) => kind.as_str(),
            Self::Named(name) => name,
        }
    }
}

///
/// RangeState
///
/// Cache state per identity. The fetching state is transient: the engine is
/// synchronous, so a fetch either completes into `HasRange` or fails leaving
/// the identity `Empty`.
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum RangeState {
    Empty,
    HasRange { next: i64, end: i64 },
}

///
/// SequenceAllocator
///

#[derive(Debug)]
pub struct SequenceAllocator {
    ranges: BTreeMap<SequenceIdentity, RangeState>,
    sequence_batch_size: u64,
}

impl SequenceAllocator {
    #[must_use]
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            ranges: BTreeMap::new(),
            sequence_batch_size: config.sequence_batch_size.max(1),
        }
    }

    /// Serve the next id for `identity`, fetching a fresh range when the
    /// cached one is absent or exhausted.
    pub fn next(
        &mut self,
        store: &dyn Store,
        identity: &SequenceIdentity,
    ) -> Result<i64, PersistError> {
        let state = self
            .ranges
            .entry(identity.clone())
            .or_insert(RangeState::Empty);

        if let RangeState::HasRange { next, end } = *state {
            *state = if next == end {
                RangeState::Empty
            } else {
                RangeState::HasRange {
                    next: next + 1,
                    end,
                }
            };
            return Ok(next);
        }

        // Empty: fetch a fresh range of the identity's batch size.
        let size = match identity {
            SequenceIdentity::Kind(_) => EngineConfig::AUTO_ID_BATCH_SIZE,
            SequenceIdentity::Named(_) => self.sequence_batch_size,
        };
        let range = store
            .allocate_id_range(identity.store_name(), size)
            .map_err(|fault| fault.into_persist("allocate_id_range"))?;
        if range.is_empty() || range.len() < size {
            return Err(PersistError::Store {
                operation: "allocate_id_range".to_string(),
                message: format!(
                    "store returned {} id(s) for a request of {size} ({identity:?})",
                    range.len()
                ),
            });
        }

        sink::record(MetricsEvent::SequenceFetch { size });

        // Cache the remainder of the range, already advanced past the id
        // being served.
        let state = self.ranges.get_mut(identity).expect("entry created above");
        *state = if range.start == range.end {
            RangeState::Empty
        } else {
            RangeState::HasRange {
                next: range.start + 1,
                end: range.end,
            }
        };

        Ok(range.start)
    }
}
