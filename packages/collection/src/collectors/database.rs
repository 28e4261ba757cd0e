//! Source-database collector.
//!
//! Opens a connection to the configured MySQL or PostgreSQL instance
//! (distinguished by port: 3306 vs 5432), runs the configured query, and
//! converts each row into a record. Byte-array values become strings,
//! time values RFC 3339.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::mysql::{MySqlPoolOptions, MySqlRow};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Column, Row, TypeInfo};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{DataSourceConfig, DbConfig};
use crate::error::{CollectError, CollectResult};
use crate::record::Record;
use crate::traits::Collector;

const POOL_MAX_CONNECTIONS: u32 = 10;
const POOL_MIN_CONNECTIONS: u32 = 5;
const POOL_MAX_LIFETIME: Duration = Duration::from_secs(3600);

/// Collector that pulls records out of an upstream relational database.
pub struct DatabaseCollector;

impl DatabaseCollector {
    pub fn new() -> Self {
        Self
    }

    async fn collect_postgres(
        &self,
        cancel: &CancellationToken,
        db: &DbConfig,
    ) -> CollectResult<Vec<Record>> {
        let dsn = format!(
            "postgres://{}:{}@{}:{}/{}",
            db.user, db.password, db.host, db.port, db.database
        );

        let pool = PgPoolOptions::new()
            .max_connections(POOL_MAX_CONNECTIONS)
            .min_connections(POOL_MIN_CONNECTIONS)
            .max_lifetime(POOL_MAX_LIFETIME)
            .connect(&dsn)
            .await?;

        let rows: Vec<PgRow> = tokio::select! {
            _ = cancel.cancelled() => return Err(CollectError::Cancelled),
            result = sqlx::query(&db.query).fetch_all(&pool) => result?,
        };

        pool.close().await;
        Ok(rows.iter().map(pg_row_to_record).collect())
    }

    async fn collect_mysql(
        &self,
        cancel: &CancellationToken,
        db: &DbConfig,
    ) -> CollectResult<Vec<Record>> {
        let dsn = format!(
            "mysql://{}:{}@{}:{}/{}",
            db.user, db.password, db.host, db.port, db.database
        );

        let pool = MySqlPoolOptions::new()
            .max_connections(POOL_MAX_CONNECTIONS)
            .min_connections(POOL_MIN_CONNECTIONS)
            .max_lifetime(POOL_MAX_LIFETIME)
            .connect(&dsn)
            .await?;

        let rows: Vec<MySqlRow> = tokio::select! {
            _ = cancel.cancelled() => return Err(CollectError::Cancelled),
            result = sqlx::query(&db.query).fetch_all(&pool) => result?,
        };

        pool.close().await;
        Ok(rows.iter().map(mysql_row_to_record).collect())
    }
}

impl Default for DatabaseCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Collector for DatabaseCollector {
    fn type_tag(&self) -> &'static str {
        "database"
    }

    async fn collect(
        &self,
        cancel: &CancellationToken,
        config: &DataSourceConfig,
    ) -> CollectResult<Vec<Record>> {
        let db = config
            .db_config
            .as_ref()
            .ok_or(CollectError::MissingConfig("db_config"))?;

        info!(host = %db.host, port = db.port, database = %db.database, "database collection starting");

        let records = match db.port {
            5432 => self.collect_postgres(cancel, db).await?,
            3306 => self.collect_mysql(cancel, db).await?,
            port => return Err(CollectError::UnsupportedDatabasePort { port }),
        };

        info!(records = records.len(), "database collection completed");
        Ok(records)
    }
}

fn pg_row_to_record(row: &PgRow) -> Record {
    let mut record = Record::new();
    for (index, column) in row.columns().iter().enumerate() {
        record.insert(column.name().to_string(), pg_value(row, index));
    }
    record
}

fn pg_value(row: &PgRow, index: usize) -> Value {
    let type_name = row.columns()[index].type_info().name().to_string();

    match type_name.as_str() {
        "BOOL" => opt_value(row.try_get::<Option<bool>, _>(index).ok().flatten(), Value::Bool),
        "INT2" => opt_value(row.try_get::<Option<i16>, _>(index).ok().flatten(), |v| {
            Value::from(v as i64)
        }),
        "INT4" => opt_value(row.try_get::<Option<i32>, _>(index).ok().flatten(), |v| {
            Value::from(v as i64)
        }),
        "INT8" => opt_value(row.try_get::<Option<i64>, _>(index).ok().flatten(), Value::from),
        "FLOAT4" => opt_value(row.try_get::<Option<f32>, _>(index).ok().flatten(), |v| {
            Value::from(v as f64)
        }),
        "FLOAT8" => opt_value(row.try_get::<Option<f64>, _>(index).ok().flatten(), Value::from),
        "TIMESTAMPTZ" => opt_value(
            row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(index)
                .ok()
                .flatten(),
            |v| Value::String(v.to_rfc3339()),
        ),
        "TIMESTAMP" => opt_value(
            row.try_get::<Option<chrono::NaiveDateTime>, _>(index)
                .ok()
                .flatten(),
            |v| Value::String(v.and_utc().to_rfc3339()),
        ),
        "DATE" => opt_value(
            row.try_get::<Option<chrono::NaiveDate>, _>(index).ok().flatten(),
            |v| Value::String(v.to_string()),
        ),
        "BYTEA" => opt_value(
            row.try_get::<Option<Vec<u8>>, _>(index).ok().flatten(),
            |v| Value::String(String::from_utf8_lossy(&v).into_owned()),
        ),
        "JSON" | "JSONB" => opt_value(
            row.try_get::<Option<Value>, _>(index).ok().flatten(),
            |v| v,
        ),
        _ => fallback_string(row.try_get::<Option<String>, _>(index), &type_name),
    }
}

fn mysql_row_to_record(row: &MySqlRow) -> Record {
    let mut record = Record::new();
    for (index, column) in row.columns().iter().enumerate() {
        record.insert(column.name().to_string(), mysql_value(row, index));
    }
    record
}

fn mysql_value(row: &MySqlRow, index: usize) -> Value {
    let type_name = row.columns()[index].type_info().name().to_string();

    match type_name.as_str() {
        "BOOLEAN" | "TINYINT" => opt_value(
            row.try_get::<Option<i8>, _>(index).ok().flatten(),
            |v| Value::from(v as i64),
        ),
        "SMALLINT" => opt_value(row.try_get::<Option<i16>, _>(index).ok().flatten(), |v| {
            Value::from(v as i64)
        }),
        "INT" | "MEDIUMINT" => opt_value(row.try_get::<Option<i32>, _>(index).ok().flatten(), |v| {
            Value::from(v as i64)
        }),
        "BIGINT" => opt_value(row.try_get::<Option<i64>, _>(index).ok().flatten(), Value::from),
        "FLOAT" => opt_value(row.try_get::<Option<f32>, _>(index).ok().flatten(), |v| {
            Value::from(v as f64)
        }),
        "DOUBLE" => opt_value(row.try_get::<Option<f64>, _>(index).ok().flatten(), Value::from),
        "DATETIME" | "TIMESTAMP" => opt_value(
            row.try_get::<Option<chrono::NaiveDateTime>, _>(index)
                .ok()
                .flatten(),
            |v| Value::String(v.and_utc().to_rfc3339()),
        ),
        "DATE" => opt_value(
            row.try_get::<Option<chrono::NaiveDate>, _>(index).ok().flatten(),
            |v| Value::String(v.to_string()),
        ),
        "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" | "VARBINARY" | "BINARY" => opt_value(
            row.try_get::<Option<Vec<u8>>, _>(index).ok().flatten(),
            |v| Value::String(String::from_utf8_lossy(&v).into_owned()),
        ),
        "JSON" => opt_value(row.try_get::<Option<Value>, _>(index).ok().flatten(), |v| v),
        _ => fallback_string(row.try_get::<Option<String>, _>(index), &type_name),
    }
}

fn opt_value<T>(value: Option<T>, convert: impl FnOnce(T) -> Value) -> Value {
    value.map(convert).unwrap_or(Value::Null)
}

fn fallback_string(result: Result<Option<String>, sqlx::Error>, type_name: &str) -> Value {
    match result {
        Ok(Some(s)) => Value::String(s),
        Ok(None) => Value::Null,
        Err(e) => {
            warn!(column_type = %type_name, error = %e, "column type not convertible, storing null");
            debug!("unconverted column type: {type_name}");
            Value::Null
        }
    }
}
