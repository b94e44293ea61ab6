//! Module: batch
//! Responsibility: the bounded accumulation window for batched writes and
//! deletes.
//! Does not own: the decision of how accumulated operations map onto store
//! calls — that belongs to the handler given to `finish_batch_operation`
//! (the flush path, in practice).
//!
//! Invariants:
//! - `Idle → Accumulating → Idle`; never stuck in `Accumulating`, even when
//!   the finish handler fails.
//! - Accumulated items are handed to the handler in insertion order.

use crate::{
    error::PersistError,
    obs::sink::{self, MetricsEvent},
};

///
/// BatchState
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum BatchState {
    Idle,
    Accumulating,
}

///
/// BatchManager
///
/// Transaction-scoped accumulator for one operation kind. One instance per
/// session and kind (inserts, deletes); never shared across threads.
///

#[derive(Debug)]
pub struct BatchManager<T> {
    state: BatchState,
    pending: Vec<T>,
}

impl<T> Default for BatchManager<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BatchManager<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: BatchState::Idle,
            pending: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_batch_operation(&self) -> bool {
        self.state == BatchState::Accumulating
    }

    /// Open the accumulation window.
    pub fn start_batch_operation(&mut self) -> Result<(), PersistError> {
        if self.state == BatchState::Accumulating {
            return Err(PersistError::illegal_state(
                "batch operation already in progress",
            ));
        }
        self.state = BatchState::Accumulating;

        Ok(())
    }

    /// Append one candidate operation, in insertion order.
    pub fn add(&mut self, item: T) -> Result<(), PersistError> {
        if self.state == BatchState::Idle {
            return Err(PersistError::illegal_state(
                "no batch operation in progress",
            ));
        }
        self.pending.push(item);
        sink::record(MetricsEvent::BatchAccumulated {
            pending: self.pending.len() as u64,
        });

        Ok(())
    }

    /// Close the window and hand the accumulated items to `handler`.
    ///
    /// The transition back to `Idle` happens *before* the handler runs, so a
    /// handler failure propagates to the caller without wedging the state
    /// machine; the manager is immediately usable for the next operation.
    pub fn finish_batch_operation<R>(
        &mut self,
        handler: impl FnOnce(Vec<T>) -> Result<R, PersistError>,
    ) -> Result<R, PersistError> {
        if self.state == BatchState::Idle {
            return Err(PersistError::illegal_state(
                "no batch operation in progress",
            ));
        }

        self.state = BatchState::Idle;
        let items = std::mem::take(&mut self.pending);

        handler(items)
    }
}
