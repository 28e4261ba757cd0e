//! Core traits: pluggable collectors and sinks.

pub mod collector;
pub mod sink;

pub use collector::{Collector, CollectorRegistry};
pub use sink::{apply_mapping, Sink, SinkRegistry};
