//! Rule-driven record processing: cleaning, field transforms, and an
//! optional deduplication stage.

pub mod cleaner;
pub mod dedup;

use std::sync::Arc;

use tracing::debug;

use crate::config::{ProcessorConfig, TransformRule};
use crate::error::ProcessResult;
use crate::record::Record;

pub use dedup::{Deduplicator, StatsSnapshot};

/// Applies the configured rules to a record batch.
///
/// The deduplicator is injected rather than owned so a job can keep one
/// filter (and its cache) across attempts while processors stay
/// per-attempt values.
pub struct Processor {
    config: ProcessorConfig,
    deduplicator: Option<Arc<Deduplicator>>,
}

impl Processor {
    pub fn new(config: ProcessorConfig) -> Self {
        Self {
            config,
            deduplicator: None,
        }
    }

    /// Attach a job-scoped deduplicator for the final stage.
    pub fn with_deduplicator(mut self, deduplicator: Arc<Deduplicator>) -> Self {
        self.deduplicator = Some(deduplicator);
        self
    }

    /// Clean, transform, then deduplicate.
    pub fn process(&self, records: Vec<Record>) -> ProcessResult<Vec<Record>> {
        let input_count = records.len();

        let mut records = if self.config.cleaning_rules.is_empty() {
            records
        } else {
            cleaner::clean(records, &self.config.cleaning_rules)?
        };

        if !self.config.transform_rules.is_empty() {
            records = records
                .into_iter()
                .map(|r| apply_transforms(r, &self.config.transform_rules))
                .collect();
        }

        if let Some(deduplicator) = &self.deduplicator {
            records = deduplicator.deduplicate(records)?;
        }

        debug!(input = input_count, output = records.len(), "processing completed");
        Ok(records)
    }
}

/// Move each source field to its target name. Missing sources are
/// skipped; a target equal to its source is a no-op.
fn apply_transforms(mut record: Record, rules: &[TransformRule]) -> Record {
    for rule in rules {
        if rule.target_field.is_empty() || rule.target_field == rule.source_field {
            continue;
        }
        if let Some(value) = record.remove(&rule.source_field) {
            record.insert(rule.target_field.clone(), value);
        }
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CleaningRule, DedupStrategy, DeduplicatorConfig, RuleType};
    use crate::record::record_from;
    use serde_json::json;

    #[test]
    fn test_transform_moves_field() {
        let rules = vec![TransformRule {
            name: String::new(),
            source_field: "name".to_string(),
            target_field: "title".to_string(),
        }];

        let record = record_from([("name", json!("Alice")), ("age", json!(30))]);
        let out = apply_transforms(record, &rules);

        assert_eq!(out.get("title"), Some(&json!("Alice")));
        assert!(out.get("name").is_none());
        assert_eq!(out.get("age"), Some(&json!(30)));
    }

    #[test]
    fn test_transform_missing_source_is_skipped() {
        let rules = vec![TransformRule {
            name: String::new(),
            source_field: "missing".to_string(),
            target_field: "present".to_string(),
        }];

        let record = record_from([("a", json!(1))]);
        let out = apply_transforms(record, &rules);
        assert!(out.get("present").is_none());
    }

    #[test]
    fn test_process_cleans_then_transforms() {
        let config = ProcessorConfig {
            cleaning_rules: vec![CleaningRule {
                name: String::new(),
                field: "name".to_string(),
                rule_type: RuleType::Trim,
                pattern: String::new(),
                replacement: String::new(),
            }],
            transform_rules: vec![TransformRule {
                name: String::new(),
                source_field: "name".to_string(),
                target_field: "title".to_string(),
            }],
            deduplication: None,
        };

        let processor = Processor::new(config);
        let out = processor
            .process(vec![record_from([("name", json!("  Alice "))])])
            .unwrap();

        assert_eq!(out[0].get("title"), Some(&json!("Alice")));
    }

    #[tokio::test]
    async fn test_process_with_dedup_stage() {
        let dedup = Deduplicator::new(DeduplicatorConfig {
            strategy: DedupStrategy::FieldBased,
            fields: vec!["email".to_string()],
            ..DeduplicatorConfig::default()
        });

        let processor = Processor::new(ProcessorConfig::default()).with_deduplicator(dedup.clone());

        let records = vec![
            record_from([("id", json!(1)), ("email", json!("a@x.com"))]),
            record_from([("id", json!(2)), ("email", json!("b@x.com"))]),
            record_from([("id", json!(3)), ("email", json!("a@x.com"))]),
        ];

        let out = processor.process(records).unwrap();
        assert_eq!(out.len(), 2);

        let stats = dedup.stats();
        assert_eq!(stats.total_processed, 3);
        assert_eq!(stats.duplicates, 1);
        dedup.close();
    }
}
