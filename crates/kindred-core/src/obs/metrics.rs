//! Process-local metrics counters.
//!
//! Counters are thread-local: sessions are single-threaded by design, and a
//! multi-session process reads each thread's window independently.

use std::cell::RefCell;

thread_local! {
    static STATE: RefCell<CounterState> = RefCell::new(CounterState::default());
}

///
/// CounterState
///
/// Saturating operation counters for one thread's engine activity.
///

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CounterState {
    pub insert_calls: u64,
    pub update_calls: u64,
    pub delete_calls: u64,
    pub load_calls: u64,
    pub entities_written: u64,
    pub cascade_children: u64,
    pub flush_store_calls: u64,
    pub sequence_fetches: u64,
    pub collisions: u64,
    pub rollbacks: u64,
    pub batch_accumulated: u64,
}

pub(crate) fn with_state_mut<T>(f: impl FnOnce(&mut CounterState) -> T) -> T {
    STATE.with(|cell| f(&mut cell.borrow_mut()))
}

/// Snapshot the current thread's counters.
#[must_use]
pub fn report() -> CounterState {
    STATE.with(|cell| *cell.borrow())
}

/// Reset the current thread's counters.
pub fn reset_all() {
    STATE.with(|cell| *cell.borrow_mut() = CounterState::default());
}
