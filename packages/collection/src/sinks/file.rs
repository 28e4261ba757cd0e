//! File sink: one pretty-printed JSON array per store call.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Local;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::StorageConfig;
use crate::error::{StoreError, StoreResult};
use crate::record::Record;
use crate::traits::Sink;

/// Writes record batches to `<base>/<database>/<table>_<timestamp>.json`.
pub struct FileSink {
    base_path: PathBuf,
}

impl FileSink {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }
}

#[async_trait]
impl Sink for FileSink {
    fn type_tag(&self) -> &'static str {
        "file"
    }

    async fn store(
        &self,
        cancel: &CancellationToken,
        config: &StorageConfig,
        records: &[Record],
    ) -> StoreResult<()> {
        if records.is_empty() {
            debug!("no records to store");
            return Ok(());
        }
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }

        let dir = self.base_path.join(&config.database);
        tokio::fs::create_dir_all(&dir).await?;

        let filename = format!("{}_{}.json", config.table, Local::now().format("%Y%m%d_%H%M%S"));
        let path = dir.join(filename);

        let json = serde_json::to_string_pretty(records)?;
        tokio::fs::write(&path, json).await?;

        info!(path = %path.display(), records = records.len(), "records written to file");
        Ok(())
    }
}
