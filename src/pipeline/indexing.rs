use super::{INDEX_TASKS, Stage, StageError, StageOutcome};
use crate::index::{IndexError, Indexer};
use crate::messages::{IndexRecord, decode};
use crate::transport::Delivery;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::timeout;

/// Upserts index records, creating the index on first use.
///
/// Records merge field by field, so OCR records and later summary updates can arrive in
/// any order. An unreachable or slow indexer is retried; a record the indexer refuses is
/// logged and acknowledged.
pub struct IndexStage {
    indexer: Arc<dyn Indexer>,
    index_name: String,
    call_timeout: Duration,
    schema_ready: AtomicBool,
}

impl IndexStage {
    /// Build the stage for `index_name`.
    pub fn new(
        indexer: Arc<dyn Indexer>,
        index_name: impl Into<String>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            indexer,
            index_name: index_name.into(),
            call_timeout,
            schema_ready: AtomicBool::new(false),
        }
    }

    async fn ensure_schema(&self) -> Result<(), StageError> {
        if self.schema_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        timeout(self.call_timeout, self.indexer.ensure_schema(&self.index_name))
            .await
            .map_err(|_| {
                StageError::Transient(format!("schema check timed out after {:?}", self.call_timeout))
            })?
            .map_err(|error| StageError::Transient(format!("schema check failed: {error}")))?;
        self.schema_ready.store(true, Ordering::Release);
        Ok(())
    }
}

#[async_trait]
impl Stage for IndexStage {
    fn name(&self) -> &'static str {
        "index"
    }

    fn queue(&self) -> &'static str {
        INDEX_TASKS
    }

    async fn handle(&self, delivery: &Delivery) -> Result<StageOutcome, StageError> {
        let record: IndexRecord = decode(&delivery.body)?;
        let document_id = record.document_id.clone();
        tracing::info!(
            document_id = %document_id,
            filename = ?record.filename,
            has_summary = record.summary.is_some(),
            "Indexing document"
        );

        self.ensure_schema().await?;

        let upserted = timeout(
            self.call_timeout,
            self.indexer.upsert(&self.index_name, &document_id, record),
        )
        .await
        .map_err(|_| StageError::Transient(format!("upsert timed out after {:?}", self.call_timeout)))?;

        match upserted {
            Ok(()) => {
                tracing::info!(document_id = %document_id, "Indexed");
                Ok(StageOutcome::Completed)
            }
            Err(IndexError::MissingIndex(index)) => {
                // Index vanished after the schema check; re-check on the retry.
                self.schema_ready.store(false, Ordering::Release);
                Err(StageError::Transient(format!("index {index} missing")))
            }
            Err(error @ IndexError::Unavailable(_)) => Err(StageError::Transient(error.to_string())),
            Err(error @ (IndexError::Rejected(_) | IndexError::AlreadyExists(_))) => {
                tracing::error!(document_id = %document_id, error = %error, "Index rejected record");
                Ok(StageOutcome::degraded(error.to_string()))
            }
        }
    }
}
