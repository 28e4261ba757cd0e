//! Relational sink (PostgreSQL).
//!
//! Auto-creates the target table from the first record's shape, then
//! inserts row by row inside one transaction with
//! `ON CONFLICT DO NOTHING`. Delivery is at-least-once: duplicates are
//! counted, not errors, and the call only fails when every insert
//! errored.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Row};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::StorageConfig;
use crate::error::{StoreError, StoreResult};
use crate::record::Record;
use crate::traits::{apply_mapping, Sink};

/// Writes record batches into a PostgreSQL table.
pub struct PostgresSink {
    pool: PgPool,
}

impl PostgresSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the target table if absent: serial id, collected_at stamp,
    /// one TEXT column per key in the sample record.
    async fn ensure_table(&self, table: &str, sample: &Record) -> StoreResult<()> {
        let exists: bool = sqlx::query(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_name = $1)",
        )
        .bind(table)
        .fetch_one(&self.pool)
        .await?
        .get(0);

        if exists {
            return Ok(());
        }

        let mut columns = vec![
            "id SERIAL PRIMARY KEY".to_string(),
            "collected_at TIMESTAMP DEFAULT NOW()".to_string(),
        ];
        for key in sample.keys() {
            columns.push(format!("{} TEXT", quote_ident(key)));
        }

        let ddl = format!("CREATE TABLE {} ({})", quote_ident(table), columns.join(", "));
        info!(table = %table, "auto-creating target table");
        sqlx::query(&ddl).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl Sink for PostgresSink {
    fn type_tag(&self) -> &'static str {
        "postgresql"
    }

    async fn store(
        &self,
        cancel: &CancellationToken,
        config: &StorageConfig,
        records: &[Record],
    ) -> StoreResult<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mapped: Vec<Record> = records
            .iter()
            .map(|r| apply_mapping(r, &config.mapping))
            .collect();

        self.ensure_table(&config.table, &mapped[0]).await?;

        // Column set comes from the first record; BTreeMap keys give a
        // stable order.
        let columns: Vec<String> = mapped[0].keys().cloned().collect();
        let column_list = columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (1..=columns.len())
            .map(|i| format!("${i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let insert = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT DO NOTHING",
            quote_ident(&config.table),
            column_list,
            placeholders
        );

        let mut tx = self.pool.begin().await?;
        let mut success = 0usize;
        let mut duplicate = 0usize;
        let mut errored = 0usize;

        for record in &mapped {
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }

            let mut query = sqlx::query(&insert);
            for column in &columns {
                query = query.bind(column_text(record.get(column)));
            }

            match query.execute(&mut *tx).await {
                Ok(result) if result.rows_affected() > 0 => success += 1,
                Ok(_) => duplicate += 1,
                Err(e) => {
                    warn!(table = %config.table, error = %e, "row insert failed");
                    errored += 1;
                }
            }
        }

        tx.commit().await?;

        info!(
            table = %config.table,
            success, duplicate, errored,
            "postgres store completed"
        );

        if success == 0 && duplicate == 0 && errored > 0 {
            return Err(StoreError::AllInsertsFailed { count: errored });
        }
        Ok(())
    }
}

/// Render a record value for a TEXT column. Strings go through as-is,
/// composites as compact JSON, nulls as SQL NULL.
fn column_text(value: Option<&Value>) -> Option<String> {
    match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    }
}

/// Double-quote an identifier, dropping any embedded quotes.
fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', ""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_column_text() {
        assert_eq!(column_text(None), None);
        assert_eq!(column_text(Some(&json!(null))), None);
        assert_eq!(column_text(Some(&json!("abc"))), Some("abc".to_string()));
        assert_eq!(column_text(Some(&json!(42))), Some("42".to_string()));
        assert_eq!(
            column_text(Some(&json!({"a": 1}))),
            Some(r#"{"a":1}"#.to_string())
        );
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("bad\"name"), "\"badname\"");
    }
}
