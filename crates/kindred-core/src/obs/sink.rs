//! Metrics sink boundary.
//!
//! Engine code MUST NOT depend on `obs::metrics` directly; all
//! instrumentation flows through [`MetricsEvent`] and [`MetricsSink`]. This
//! module is the only bridge between execution logic and counter state.

use crate::obs::metrics;
use std::{cell::RefCell, rc::Rc};

thread_local! {
    static SINK_OVERRIDE: RefCell<Option<Rc<dyn MetricsSink>>> = const { RefCell::new(None) };
}

///
/// ExecKind
///

#[derive(Clone, Copy, Debug)]
pub enum ExecKind {
    Insert,
    Update,
    Delete,
    Load,
}

///
/// MetricsEvent
///

#[derive(Clone, Copy, Debug)]
pub enum MetricsEvent {
    ExecStart { kind: ExecKind },
    ExecFinish { kind: ExecKind, entities: u64 },
    CascadeFanout { children: u64 },
    FlushIssued { entities: u64, store_calls: u64 },
    SequenceFetch { size: u64 },
    Collision,
    TxnRollback,
    BatchAccumulated { pending: u64 },
}

///
/// MetricsSink
///

pub trait MetricsSink {
    fn record(&self, event: MetricsEvent);
}

/// GlobalMetricsSink
/// Default sink that writes into the thread's counter state; active when no
/// scoped override is installed.

pub(crate) struct GlobalMetricsSink;

impl MetricsSink for GlobalMetricsSink {
    fn record(&self, event: MetricsEvent) {
        metrics::with_state_mut(|m| match event {
            MetricsEvent::ExecStart { kind } => match kind {
                ExecKind::Insert => m.insert_calls = m.insert_calls.saturating_add(1),
                ExecKind::Update => m.update_calls = m.update_calls.saturating_add(1),
                ExecKind::Delete => m.delete_calls = m.delete_calls.saturating_add(1),
                ExecKind::Load => m.load_calls = m.load_calls.saturating_add(1),
            },
            MetricsEvent::ExecFinish { entities, .. } => {
                m.entities_written = m.entities_written.saturating_add(entities);
            }
            MetricsEvent::CascadeFanout { children } => {
                m.cascade_children = m.cascade_children.saturating_add(children);
            }
            MetricsEvent::FlushIssued { store_calls, .. } => {
                m.flush_store_calls = m.flush_store_calls.saturating_add(store_calls);
            }
            MetricsEvent::SequenceFetch { .. } => {
                m.sequence_fetches = m.sequence_fetches.saturating_add(1);
            }
            MetricsEvent::Collision => m.collisions = m.collisions.saturating_add(1),
            MetricsEvent::TxnRollback => m.rollbacks = m.rollbacks.saturating_add(1),
            MetricsEvent::BatchAccumulated { .. } => {
                m.batch_accumulated = m.batch_accumulated.saturating_add(1);
            }
        });
    }
}

pub(crate) fn record(event: MetricsEvent) {
    let sink = SINK_OVERRIDE.with(|cell| cell.borrow().clone());
    match sink {
        Some(sink) => sink.record(event),
        None => GlobalMetricsSink.record(event),
    }
}

/// Run a closure with a temporary metrics sink override. The previous
/// override is restored on all exits, including unwind.
pub fn with_metrics_sink<T>(sink: Rc<dyn MetricsSink>, f: impl FnOnce() -> T) -> T {
    struct Guard(Option<Rc<dyn MetricsSink>>);

    impl Drop for Guard {
        fn drop(&mut self) {
            let previous = self.0.take();
            SINK_OVERRIDE.with(|cell| {
                *cell.borrow_mut() = previous;
            });
        }
    }

    let previous = SINK_OVERRIDE.with(|cell| cell.borrow_mut().replace(sink));
    let _guard = Guard(previous);

    f()
}

///
/// Span
///
/// RAII guard emitting start/finish events for one engine operation; finish
/// accounting happens even on unwind.
///

pub(crate) struct Span {
    kind: ExecKind,
    entities: u64,
}

impl Span {
    #[must_use]
    pub fn new(kind: ExecKind) -> Self {
        record(MetricsEvent::ExecStart { kind });

        Self { kind, entities: 0 }
    }

    pub const fn set_entities(&mut self, entities: u64) {
        self.entities = entities;
    }
}

impl Drop for Span {
    fn drop(&mut self) {
        record(MetricsEvent::ExecFinish {
            kind: self.kind,
            entities: self.entities,
        });
    }
}
