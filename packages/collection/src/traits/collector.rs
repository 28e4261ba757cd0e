//! Collector trait for pluggable data collection.
//!
//! A collector turns a data-source config into a finite sequence of
//! records. Implementations cover web automation, HTTP APIs, and source
//! databases; the worker binds them by type tag at startup and never
//! depends on a concrete collector.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::DataSourceConfig;
use crate::error::{CollectError, CollectResult};
use crate::record::Record;

/// Pluggable record collector.
///
/// `collect` must honor `cancel`: every suspension point (network I/O,
/// navigation waits, query execution) races against it, and a cancelled
/// collection surfaces `CollectError::Cancelled`.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Stable type tag this collector serves: web-rpa, api, database.
    fn type_tag(&self) -> &'static str;

    /// Collect records from the configured source.
    async fn collect(
        &self,
        cancel: &CancellationToken,
        config: &DataSourceConfig,
    ) -> CollectResult<Vec<Record>>;
}

/// Tag → collector binding, populated once at worker start.
///
/// Lookup is a plain read; nothing registers after startup, so no
/// interior locking.
#[derive(Default)]
pub struct CollectorRegistry {
    collectors: HashMap<&'static str, Arc<dyn Collector>>,
}

impl CollectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a collector under its own type tag.
    pub fn register(&mut self, collector: Arc<dyn Collector>) {
        self.collectors.insert(collector.type_tag(), collector);
    }

    pub fn get(&self, type_tag: &str) -> Option<Arc<dyn Collector>> {
        self.collectors.get(type_tag).cloned()
    }

    /// Lookup that surfaces a typed error for unknown tags.
    pub fn require(&self, type_tag: &str) -> CollectResult<Arc<dyn Collector>> {
        self.get(type_tag)
            .ok_or_else(|| CollectError::UnsupportedType(type_tag.to_string()))
    }

    pub fn tags(&self) -> Vec<&'static str> {
        self.collectors.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticCollector;

    #[async_trait]
    impl Collector for StaticCollector {
        fn type_tag(&self) -> &'static str {
            "static"
        }

        async fn collect(
            &self,
            _cancel: &CancellationToken,
            _config: &DataSourceConfig,
        ) -> CollectResult<Vec<Record>> {
            Ok(vec![Record::new()])
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = CollectorRegistry::new();
        registry.register(Arc::new(StaticCollector));

        assert!(registry.get("static").is_some());
        assert!(registry.get("missing").is_none());
        assert!(matches!(
            registry.require("missing"),
            Err(CollectError::UnsupportedType(_))
        ));
    }
}
