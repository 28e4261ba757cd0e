//! Document sink (MongoDB).
//!
//! Batch-inserts with `ordered = false` so one bad document does not
//! reject the rest. Duplicate-key errors are tolerated; every document
//! is stamped with creation and update times.

use async_trait::async_trait;
use bson::Document;
use mongodb::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::StorageConfig;
use crate::error::{StoreError, StoreResult};
use crate::record::Record;
use crate::traits::Sink;

/// Writes record batches into a MongoDB collection.
pub struct MongoSink {
    client: Client,
    default_database: String,
}

impl MongoSink {
    /// Connect with a standard connection string.
    pub async fn connect(uri: &str, default_database: impl Into<String>) -> StoreResult<Self> {
        let client = Client::with_uri_str(uri).await?;
        Ok(Self {
            client,
            default_database: default_database.into(),
        })
    }

    pub fn new(client: Client, default_database: impl Into<String>) -> Self {
        Self {
            client,
            default_database: default_database.into(),
        }
    }
}

#[async_trait]
impl Sink for MongoSink {
    fn type_tag(&self) -> &'static str {
        "mongodb"
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
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }

        let database = if config.database.is_empty() {
            self.default_database.as_str()
        } else {
            config.database.as_str()
        };
        let collection = self
            .client
            .database(database)
            .collection::<Document>(&config.table);

        let now = bson::DateTime::now();
        let mut documents = Vec::with_capacity(records.len());
        for record in records {
            let mut document = bson::to_document(record)?;
            document.insert("_created_at", now);
            document.insert("_updated_at", now);
            documents.push(document);
        }

        let count = documents.len();
        match collection.insert_many(documents).ordered(false).await {
            Ok(result) => {
                info!(
                    collection = %config.table,
                    inserted = result.inserted_ids.len(),
                    "mongodb store completed"
                );
                Ok(())
            }
            Err(e) if is_duplicate_key(&e) => {
                warn!(
                    collection = %config.table,
                    batch = count,
                    "some documents already existed, continuing"
                );
                Ok(())
            }
            Err(e) => Err(StoreError::Mongo(e)),
        }
    }
}

/// True when the failure is (only) about already-present documents.
fn is_duplicate_key(error: &mongodb::error::Error) -> bool {
    let text = error.to_string();
    text.contains("E11000") || text.contains("duplicate key")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::record_from;
    use serde_json::json;

    #[test]
    fn test_record_converts_to_document() {
        let record = record_from([
            ("name", json!("Alice")),
            ("age", json!(30)),
            ("tags", json!(["a", "b"])),
        ]);

        let document = bson::to_document(&record).unwrap();
        assert_eq!(document.get_str("name").unwrap(), "Alice");
        assert!(document.get("age").is_some());
        assert_eq!(document.get_array("tags").unwrap().len(), 2);
    }
}
