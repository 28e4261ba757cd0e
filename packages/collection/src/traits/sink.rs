//! Sink trait for pluggable record storage.
//!
//! A sink accepts a processed record sequence against a target
//! table/collection. Delivery is at-least-once: sinks are expected to
//! make inserts idempotent (conflict-ignore) rather than transactional.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::StorageConfig;
use crate::error::{StoreError, StoreResult};
use crate::record::Record;

/// Pluggable record sink.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Stable target tag this sink serves: file, postgresql, mongodb.
    fn type_tag(&self) -> &'static str;

    /// Write the record sequence to the configured target.
    async fn store(
        &self,
        cancel: &CancellationToken,
        config: &StorageConfig,
        records: &[Record],
    ) -> StoreResult<()>;
}

/// Tag → sink binding, populated once at worker start.
#[derive(Default)]
pub struct SinkRegistry {
    sinks: HashMap<&'static str, Arc<dyn Sink>>,
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, sink: Arc<dyn Sink>) {
        self.sinks.insert(sink.type_tag(), sink);
    }

    pub fn get(&self, type_tag: &str) -> Option<Arc<dyn Sink>> {
        self.sinks.get(type_tag).cloned()
    }

    /// Lookup that surfaces a typed error for unknown tags.
    pub fn require(&self, type_tag: &str) -> StoreResult<Arc<dyn Sink>> {
        self.get(type_tag)
            .ok_or_else(|| StoreError::UnsupportedTarget(type_tag.to_string()))
    }

    pub fn tags(&self) -> Vec<&'static str> {
        self.sinks.keys().copied().collect()
    }
}

/// Apply the configured field mapping to one record: mapped keys are
/// renamed, unmapped keys pass through with their original name.
pub fn apply_mapping(record: &Record, mapping: &HashMap<String, String>) -> Record {
    record
        .iter()
        .map(|(key, value)| {
            let target = mapping.get(key).cloned().unwrap_or_else(|| key.clone());
            (target, value.clone())
        })
        .collect()
}
