//! Task configuration resolved per execution attempt.
//!
//! A `TaskConfig` is either stored verbatim on the job row or synthesized
//! by the worker from the referenced data source. The shapes here mirror
//! what the control plane writes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Full per-attempt configuration: where to collect, how to process,
/// where to store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub data_source: DataSourceConfig,
    #[serde(default)]
    pub processor: ProcessorConfig,
    pub storage: StorageConfig,
}

/// Data-source half of a task config.
///
/// `source_type` selects the collector family; the remaining fields are
/// interpreted by that collector.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataSourceConfig {
    #[serde(rename = "type")]
    pub source_type: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Field name → CSS selector or JSON path. `_list` and `_data_path`
    /// are reserved keys (list container and extraction root).
    #[serde(default)]
    pub selectors: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpa_config: Option<RpaConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_config: Option<DbConfig>,
}

/// Browser automation sub-config for the web-rpa collector.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RpaConfig {
    /// Credentialed login; session cookies are reused across runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login: Option<LoginConfig>,
    /// Actions executed after navigation, before extraction.
    #[serde(default)]
    pub actions: Vec<RpaAction>,
    /// Cookies injected before navigation (manual-cookie mode).
    #[serde(default)]
    pub initial_cookies: Vec<CookieSpec>,
    /// Raw `name=value; name2=value2` cookie header, parsed and injected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie_string: Option<String>,
    /// Selector that must be present in the rendered page when the
    /// session is authenticated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_selector: Option<String>,
}

/// Credentialed login sequence for the RPA collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginConfig {
    /// Login page; defaults to the data-source URL when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login_url: Option<String>,
    pub username: String,
    pub password: String,
    pub username_selector: String,
    pub password_selector: String,
    pub submit_selector: String,
    /// Anchor that appears once login has completed; waited on for up
    /// to 3s, then assumed done.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_selector: Option<String>,
}

/// One post-navigation browser action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RpaAction {
    Input { selector: String, value: String },
    Click { selector: String },
    Select { selector: String, value: String },
    Wait {
        #[serde(default)]
        ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        wait_for: Option<String>,
    },
}

/// A cookie injected into the browser before navigation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CookieSpec {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub path: String,
}

/// Source-database connection and query for the database collector.
/// The port selects the driver: 3306 MySQL, 5432 PostgreSQL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub query: String,
}

/// Processing half of a task config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessorConfig {
    #[serde(default)]
    pub cleaning_rules: Vec<CleaningRule>,
    #[serde(default)]
    pub transform_rules: Vec<TransformRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deduplication: Option<DeduplicatorConfig>,
}

/// One field-level cleaning rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleaningRule {
    #[serde(default)]
    pub name: String,
    pub field: String,
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    #[serde(default)]
    pub pattern: String,
    #[serde(default)]
    pub replacement: String,
}

/// Cleaning rule vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    Trim,
    RemoveHtml,
    Regex,
    Lowercase,
    Uppercase,
    NormalizeWhitespace,
    RemoveSpecialChars,
    DateFormat,
    NumberFormat,
    EmailValidate,
    PhoneFormat,
    UrlNormalize,
}

/// Field rename/move applied after cleaning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformRule {
    #[serde(default)]
    pub name: String,
    pub source_field: String,
    pub target_field: String,
}

/// Deduplication stage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeduplicatorConfig {
    pub strategy: DedupStrategy,
    /// Projection for the `field_based` strategy.
    #[serde(default)]
    pub fields: Vec<String>,
    /// Window for the `time_window` strategy and the expiry sweep.
    #[serde(default = "default_time_window_secs")]
    pub time_window_secs: u64,
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    #[serde(default)]
    pub enable_logging: bool,
}

impl Default for DeduplicatorConfig {
    fn default() -> Self {
        Self {
            strategy: DedupStrategy::ContentHash,
            fields: Vec::new(),
            time_window_secs: default_time_window_secs(),
            cache_size: default_cache_size(),
            enable_logging: false,
        }
    }
}

/// Fingerprinting strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupStrategy {
    ContentHash,
    FieldBased,
    TimeWindow,
}

fn default_time_window_secs() -> u64 {
    24 * 60 * 60
}

fn default_cache_size() -> usize {
    10_000
}

/// Storage half of a task config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Sink tag: file, postgresql, mongodb.
    pub target: String,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub table: String,
    /// Source key → target column. Unmapped keys pass through.
    #[serde(default)]
    pub mapping: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_config_round_trip() {
        let json = r##"{
            "data_source": {
                "type": "api",
                "url": "https://api.example.com/items",
                "method": "GET",
                "selectors": {"_data_path": "data.items", "id": "id"}
            },
            "processor": {
                "cleaning_rules": [
                    {"field": "name", "type": "trim"},
                    {"field": "body", "type": "regex", "pattern": "\\d+", "replacement": "#"}
                ],
                "transform_rules": [
                    {"source_field": "name", "target_field": "title"}
                ]
            },
            "storage": {"target": "file", "database": "out", "table": "items"}
        }"##;

        let config: TaskConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.data_source.source_type, "api");
        assert_eq!(config.processor.cleaning_rules.len(), 2);
        assert_eq!(config.processor.cleaning_rules[0].rule_type, RuleType::Trim);
        assert_eq!(config.storage.target, "file");
    }

    #[test]
    fn test_rpa_action_tagged_parse() {
        let json = r##"[
            {"type": "input", "selector": "#q", "value": "rust"},
            {"type": "click", "selector": "#go"},
            {"type": "wait", "ms": 500},
            {"type": "wait", "wait_for": ".results"}
        ]"##;

        let actions: Vec<RpaAction> = serde_json::from_str(json).unwrap();
        assert_eq!(actions.len(), 4);
        assert!(matches!(actions[0], RpaAction::Input { .. }));
        assert!(matches!(actions[3], RpaAction::Wait { ref wait_for, .. } if wait_for.is_some()));
    }

    #[test]
    fn test_dedup_config_defaults() {
        let json = r#"{"strategy": "content_hash"}"#;
        let config: DeduplicatorConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.cache_size, 10_000);
        assert_eq!(config.time_window_secs, 86_400);
        assert!(!config.enable_logging);
    }
}
