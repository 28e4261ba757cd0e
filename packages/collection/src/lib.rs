//! Pluggable data collection, processing, and storage.
//!
//! The worker binds collector and sink implementations by type tag at
//! startup and drives the collect → process → store pipeline per
//! execution attempt. This crate never talks to the control database;
//! it only knows data sources, records, processing rules, and targets.
//!
//! ```text
//! Collector.collect(ctx, data_source) → records
//! Processor.process(records)          → cleaned
//! Sink.store(ctx, storage, cleaned)
//! ```

pub mod collectors;
pub mod config;
pub mod error;
pub mod processor;
pub mod record;
pub mod sinks;
pub mod traits;

pub use collectors::{ApiCollector, DatabaseCollector, RpaCollector, SessionCache};
pub use config::{
    DataSourceConfig, DedupStrategy, DeduplicatorConfig, ProcessorConfig, StorageConfig,
    TaskConfig,
};
pub use error::{CollectError, CollectResult, ProcessError, ProcessResult, StoreError, StoreResult};
pub use processor::{Deduplicator, Processor};
pub use record::Record;
pub use sinks::{FileSink, MongoSink, PostgresSink};
pub use traits::{Collector, CollectorRegistry, Sink, SinkRegistry};
