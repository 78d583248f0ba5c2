use super::{
    INDEX_TASKS, SUMMARIZE_TASKS, Stage, StageError, StageOutcome, UPLOAD_EVENTS, publish_json,
};
use crate::extraction::{ExtractionError, TextExtractor, extract_text};
use crate::messages::{ExtractedText, IndexRecord, UploadEvent, decode};
use crate::store::{Store, StoreError, text_key};
use crate::transport::{Delivery, Transport};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// Turns upload events into stored OCR text and fans it out to summarization and indexing.
///
/// A missing blob or a document without extractable text is acknowledged without
/// publishing anything. Store, extractor, and publish outages are retried through the
/// runner; stored text is overwritten on every successful attempt.
pub struct OcrStage {
    store: Arc<dyn Store>,
    extractor: Arc<dyn TextExtractor>,
    transport: Arc<dyn Transport>,
    call_timeout: Duration,
}

impl OcrStage {
    /// Build the stage from its collaborators.
    pub fn new(
        store: Arc<dyn Store>,
        extractor: Arc<dyn TextExtractor>,
        transport: Arc<dyn Transport>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            store,
            extractor,
            transport,
            call_timeout,
        }
    }

    async fn fetch(&self, event: &UploadEvent) -> Result<Result<Vec<u8>, String>, StageError> {
        let fetched = timeout(
            self.call_timeout,
            self.store.get(&event.document_id, &event.filename),
        )
        .await
        .map_err(|_| StageError::Transient(format!("blob fetch timed out after {:?}", self.call_timeout)))?;

        match fetched {
            Ok(bytes) => Ok(Ok(bytes)),
            Err(StoreError::NotFound(key)) => Ok(Err(format!("blob {key} not found"))),
            Err(StoreError::InvalidKey(key)) => {
                Err(StageError::Structural(format!("invalid blob key {key}")))
            }
            Err(error @ StoreError::Io(_)) => Err(StageError::Transient(error.to_string())),
        }
    }

    async fn extract(&self, bytes: &[u8]) -> Result<Result<String, String>, StageError> {
        let extracted = timeout(self.call_timeout, extract_text(self.extractor.as_ref(), bytes))
            .await
            .map_err(|_| {
                StageError::Transient(format!("extraction timed out after {:?}", self.call_timeout))
            })?;

        match extracted {
            Ok(text) if text.trim().is_empty() => Ok(Err("extraction produced no text".into())),
            Ok(text) => Ok(Ok(text)),
            Err(error @ ExtractionError::Unsupported(_)) => Ok(Err(error.to_string())),
            Err(error @ ExtractionError::Engine(_)) => Err(StageError::Transient(error.to_string())),
        }
    }

    async fn persist(&self, document_id: &str, text: &str) -> Result<(), StageError> {
        let key = text_key(document_id);
        let stored = timeout(
            self.call_timeout,
            self.store.put(&key, text.as_bytes().to_vec()),
        )
        .await
        .map_err(|_| StageError::Transient(format!("text upload timed out after {:?}", self.call_timeout)))?;

        match stored {
            Ok(()) => Ok(()),
            Err(StoreError::InvalidKey(key)) => {
                Err(StageError::Structural(format!("invalid text key {key}")))
            }
            Err(error) => Err(StageError::Transient(error.to_string())),
        }
    }
}

#[async_trait]
impl Stage for OcrStage {
    fn name(&self) -> &'static str {
        "ocr"
    }

    fn queue(&self) -> &'static str {
        UPLOAD_EVENTS
    }

    async fn handle(&self, delivery: &Delivery) -> Result<StageOutcome, StageError> {
        let event: UploadEvent = decode(&delivery.body)?;
        tracing::info!(
            document_id = %event.document_id,
            filename = %event.filename,
            size = ?event.size,
            "Received upload"
        );

        let bytes = match self.fetch(&event).await? {
            Ok(bytes) => bytes,
            Err(reason) => return Ok(StageOutcome::degraded(reason)),
        };
        let text = match self.extract(&bytes).await? {
            Ok(text) => text,
            Err(reason) => return Ok(StageOutcome::degraded(reason)),
        };

        self.persist(&event.document_id, &text).await?;

        // Index upserts merge, so a retry after a later failure may repeat this publish.
        // The summarize task goes last: every copy of it yields another SummaryResult.
        publish_json(
            self.transport.as_ref(),
            INDEX_TASKS,
            &IndexRecord::from_upload(&event, text.clone()),
        )
        .await?;
        let extracted = ExtractedText {
            document_id: event.document_id.clone(),
            text,
        };
        publish_json(self.transport.as_ref(), SUMMARIZE_TASKS, &extracted).await?;

        tracing::info!(
            document_id = %event.document_id,
            chars = extracted.text.len(),
            "OCR complete"
        );
        Ok(StageOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::PlainTextExtractor;
    use crate::messages::encode;
    use crate::pipeline::declare_topology;
    use crate::pipeline::test_support::{FlakyTransport, delivery};
    use crate::store::{MemoryStore, object_name};
    use crate::transport::InMemoryBroker;
    use serde_json::json;

    struct SlowExtractor;

    #[async_trait]
    impl TextExtractor for SlowExtractor {
        async fn extract_pages(&self, _bytes: &[u8]) -> Result<Vec<String>, ExtractionError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(vec!["late".into()])
        }
    }

    async fn fixture() -> (Arc<MemoryStore>, InMemoryBroker) {
        let store = Arc::new(MemoryStore::new());
        let broker = InMemoryBroker::new();
        declare_topology(&broker).await.expect("topology");
        (store, broker)
    }

    fn stage(store: Arc<MemoryStore>, transport: Arc<dyn Transport>) -> OcrStage {
        OcrStage::new(
            store,
            Arc::new(PlainTextExtractor::new()),
            transport,
            Duration::from_secs(1),
        )
    }

    fn upload(id: &str, filename: &str) -> Vec<u8> {
        encode(&UploadEvent {
            document_id: id.into(),
            filename: filename.into(),
            content_type: Some("text/plain".into()),
            uploaded_at: None,
            size: Some(10),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn publishes_text_to_both_downstream_queues() {
        let (store, broker) = fixture().await;
        store
            .put(&object_name("d1", "a.pdf"), b"Hello\x0cWorld".to_vec())
            .await
            .unwrap();
        let ocr = stage(store.clone(), Arc::new(broker.clone()));

        let outcome = ocr.handle(&delivery(upload("d1", "a.pdf"))).await;
        assert_eq!(outcome, Ok(StageOutcome::Completed));

        assert_eq!(store.object("ocr/d1.txt").unwrap(), b"Hello\n\nWorld");
        let summarize = broker.drain(SUMMARIZE_TASKS).unwrap();
        let index = broker.drain(INDEX_TASKS).unwrap();
        assert_eq!(summarize.len(), 1);
        assert_eq!(index.len(), 1);

        let task: ExtractedText = serde_json::from_slice(&summarize[0]).unwrap();
        assert_eq!(task.text, "Hello\n\nWorld");
        let record: IndexRecord = serde_json::from_slice(&index[0]).unwrap();
        assert_eq!(record.document_id, "d1");
        assert_eq!(record.filename.as_deref(), Some("a.pdf"));
        assert_eq!(record.size, Some(10));
        assert!(record.summary.is_none());
    }

    #[tokio::test]
    async fn missing_blob_is_degraded_and_publishes_nothing() {
        let (store, broker) = fixture().await;
        let ocr = stage(store, Arc::new(broker.clone()));

        let outcome = ocr.handle(&delivery(upload("d9", "gone.pdf"))).await.unwrap();
        assert!(matches!(outcome, StageOutcome::Degraded { reason } if reason.contains("not found")));
        assert!(broker.is_idle(&[SUMMARIZE_TASKS, INDEX_TASKS]));
    }

    #[tokio::test]
    async fn empty_text_is_degraded_and_publishes_nothing() {
        let (store, broker) = fixture().await;
        store
            .put(&object_name("d2", "blank.txt"), b"  \x0c \n".to_vec())
            .await
            .unwrap();
        let ocr = stage(store.clone(), Arc::new(broker.clone()));

        let outcome = ocr.handle(&delivery(upload("d2", "blank.txt"))).await.unwrap();
        assert_eq!(outcome, StageOutcome::degraded("extraction produced no text"));
        assert!(store.object("ocr/d2.txt").is_none());
        assert!(broker.is_idle(&[SUMMARIZE_TASKS, INDEX_TASKS]));
    }

    #[tokio::test]
    async fn missing_document_id_is_structural() {
        let (store, broker) = fixture().await;
        let ocr = stage(store, Arc::new(broker));
        let body = json!({ "filename": "a.pdf" }).to_string();
        let error = ocr.handle(&delivery(body)).await.unwrap_err();
        assert!(matches!(error, StageError::Structural(_)));
    }

    #[tokio::test]
    async fn extraction_timeout_is_transient() {
        let (store, broker) = fixture().await;
        store
            .put(&object_name("d3", "a.pdf"), b"text".to_vec())
            .await
            .unwrap();
        let ocr = OcrStage::new(
            store,
            Arc::new(SlowExtractor),
            Arc::new(broker),
            Duration::from_millis(20),
        );
        let error = ocr.handle(&delivery(upload("d3", "a.pdf"))).await.unwrap_err();
        assert!(matches!(error, StageError::Transient(message) if message.contains("timed out")));
    }

    #[tokio::test]
    async fn publish_failure_is_transient_and_retry_overwrites_text() {
        let (store, broker) = fixture().await;
        store
            .put(&object_name("d4", "a.pdf"), b"Hello".to_vec())
            .await
            .unwrap();
        let flaky = FlakyTransport::new(broker.clone());
        flaky.fail_publishes_to(INDEX_TASKS);
        let ocr = stage(store.clone(), flaky.clone());

        let error = ocr.handle(&delivery(upload("d4", "a.pdf"))).await.unwrap_err();
        assert!(matches!(error, StageError::Transient(_)));
        assert_eq!(broker.depth(SUMMARIZE_TASKS).unwrap(), 0);

        flaky.heal();
        let outcome = ocr.handle(&delivery(upload("d4", "a.pdf"))).await.unwrap();
        assert_eq!(outcome, StageOutcome::Completed);
        assert_eq!(store.object("ocr/d4.txt").unwrap(), b"Hello");
        assert_eq!(broker.drain(INDEX_TASKS).unwrap().len(), 1);
        assert_eq!(broker.drain(SUMMARIZE_TASKS).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn summarize_publish_failure_repeats_only_the_index_record() {
        let (store, broker) = fixture().await;
        store
            .put(&object_name("d5", "a.pdf"), b"Hello".to_vec())
            .await
            .unwrap();
        let flaky = FlakyTransport::new(broker.clone());
        flaky.fail_publishes_to(SUMMARIZE_TASKS);
        let ocr = stage(store, flaky.clone());

        let error = ocr.handle(&delivery(upload("d5", "a.pdf"))).await.unwrap_err();
        assert!(matches!(error, StageError::Transient(_)));

        flaky.heal();
        ocr.handle(&delivery(upload("d5", "a.pdf"))).await.unwrap();
        assert_eq!(broker.drain(SUMMARIZE_TASKS).unwrap().len(), 1);
        // Both index copies carry the same fields and merge into one record.
        assert_eq!(broker.drain(INDEX_TASKS).unwrap().len(), 2);
    }
}
