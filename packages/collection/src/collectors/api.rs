//! HTTP API collector.
//!
//! Issues one GET/POST against the configured URL and extracts records
//! from the JSON response body via a dotted-path vocabulary:
//! `_data_path` selects the extraction root (`@this` for the whole
//! document), the remaining selector entries map field names to paths
//! relative to each selected node.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::DataSourceConfig;
use crate::error::{CollectError, CollectResult};
use crate::record::Record;
use crate::traits::Collector;

/// Response bodies past this size abort the attempt.
const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// Collector for JSON HTTP APIs.
pub struct ApiCollector {
    client: reqwest::Client,
}

impl ApiCollector {
    /// Create a collector with a per-request timeout in seconds.
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(timeout_secs))
                .build()
                .expect("HTTP client construction cannot fail with static options"),
        }
    }

    async fn fetch(
        &self,
        cancel: &CancellationToken,
        config: &DataSourceConfig,
    ) -> CollectResult<Vec<u8>> {
        let mut request = match config.method.to_ascii_uppercase().as_str() {
            "POST" => self.client.post(&config.url),
            _ => self.client.get(&config.url),
        };

        for (name, value) in &config.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(CollectError::Cancelled),
            result = request.send() => result.map_err(|e| CollectError::Http(Box::new(e)))?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(CollectError::BadStatus {
                status: status.as_u16(),
                url: config.url.clone(),
            });
        }

        let body = tokio::select! {
            _ = cancel.cancelled() => return Err(CollectError::Cancelled),
            result = response.bytes() => result.map_err(|e| CollectError::Http(Box::new(e)))?,
        };

        if body.len() > MAX_BODY_BYTES {
            return Err(CollectError::Http(
                format!("response body too large: {} bytes", body.len()).into(),
            ));
        }

        Ok(body.to_vec())
    }
}

#[async_trait]
impl Collector for ApiCollector {
    fn type_tag(&self) -> &'static str {
        "api"
    }

    async fn collect(
        &self,
        cancel: &CancellationToken,
        config: &DataSourceConfig,
    ) -> CollectResult<Vec<Record>> {
        info!(url = %config.url, method = %config.method, "API collection starting");

        let body = self.fetch(cancel, config).await?;
        debug!(url = %config.url, bytes = body.len(), "API response received");

        let records = parse_body(&body, &config.selectors)?;
        info!(url = %config.url, records = records.len(), "API collection completed");
        Ok(records)
    }
}

/// Extract records from a JSON body using the selector map.
fn parse_body(
    body: &[u8],
    selectors: &std::collections::HashMap<String, String>,
) -> CollectResult<Vec<Record>> {
    let document: Value =
        serde_json::from_slice(body).map_err(|e| CollectError::Http(Box::new(e)))?;

    let data_path = selectors
        .get("_data_path")
        .map(String::as_str)
        .filter(|p| !p.is_empty())
        .unwrap_or("@this");

    let root = lookup_path(&document, data_path).ok_or_else(|| CollectError::DataPathMissing {
        path: data_path.to_string(),
    })?;

    let extract = |node: &Value| -> Record {
        let mut record = Record::new();
        for (field, path) in selectors {
            if field == "_data_path" {
                continue;
            }
            if let Some(value) = lookup_path(node, path) {
                record.insert(field.clone(), value.clone());
            }
        }
        record
    };

    let records = match root {
        Value::Array(items) => items.iter().map(extract).collect(),
        node => vec![extract(node)],
    };

    Ok(records)
}

/// Resolve a dotted path against a JSON value. Object segments index by
/// key, array segments by numeric position. `@this` (or an empty path)
/// selects the value itself.
fn lookup_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() || path == "@this" {
        return Some(root);
    }

    let mut current = root;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn selectors(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_lookup_path() {
        let doc = json!({"data": {"items": [{"id": 1}, {"id": 2}]}});

        assert_eq!(lookup_path(&doc, "@this"), Some(&doc));
        assert_eq!(lookup_path(&doc, "data.items.0.id"), Some(&json!(1)));
        assert_eq!(lookup_path(&doc, "data.missing"), None);
        assert_eq!(lookup_path(&doc, "data.items.9"), None);
    }

    #[test]
    fn test_parse_body_array_root() {
        let body = br#"[{"id": 1, "name": "Alice"}, {"id": 2, "name": "Bob"}]"#;
        let sel = selectors(&[("_data_path", "@this"), ("id", "id"), ("name", "name")]);

        let records = parse_body(body, &sel).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("name"), Some(&json!("Alice")));
        assert_eq!(records[1].get("id"), Some(&json!(2)));
    }

    #[test]
    fn test_parse_body_nested_path_single_object() {
        let body = br#"{"result": {"user": {"id": 7, "email": "x@example.com"}}}"#;
        let sel = selectors(&[("_data_path", "result.user"), ("id", "id"), ("email", "email")]);

        let records = parse_body(body, &sel).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("id"), Some(&json!(7)));
    }

    #[test]
    fn test_parse_body_missing_data_path() {
        let body = br#"{"a": 1}"#;
        let sel = selectors(&[("_data_path", "b.c")]);

        assert!(matches!(
            parse_body(body, &sel),
            Err(CollectError::DataPathMissing { .. })
        ));
    }

    #[test]
    fn test_parse_body_skips_missing_fields() {
        let body = br#"[{"id": 1}]"#;
        let sel = selectors(&[("id", "id"), ("name", "name")]);

        let records = parse_body(body, &sel).unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].get("name").is_none());
    }
}
