//! Engine observability: counter state and the sink boundary.
//!
//! Engine logic never touches `obs::metrics` directly; every instrumentation
//! point goes through [`sink::record`] so tests and embedders can scope in
//! their own sink.

pub mod metrics;
pub mod sink;
