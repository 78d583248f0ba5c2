use super::{
    INDEX_TASKS, SUMMARIZE_TASKS, SUMMARY_RESULTS, Stage, StageError, StageOutcome, publish_json,
};
use crate::messages::{ExtractedText, IndexRecord, SummaryResult, decode};
use crate::summarization::Summarizer;
use crate::transport::{Delivery, Transport};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// Summary published when the summarizer fails or returns nothing.
pub const FALLBACK_SUMMARY: &str = "Summary unavailable due to processing error.";

/// Produces exactly one [`SummaryResult`] per extracted text, falling back to
/// [`FALLBACK_SUMMARY`] on any summarizer failure, then refreshes the index with the summary.
pub struct SummarizeStage {
    summarizer: Arc<dyn Summarizer>,
    transport: Arc<dyn Transport>,
    call_timeout: Duration,
}

impl SummarizeStage {
    /// Build the stage from its collaborators.
    pub fn new(
        summarizer: Arc<dyn Summarizer>,
        transport: Arc<dyn Transport>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            summarizer,
            transport,
            call_timeout,
        }
    }

    async fn summarize(&self, text: &str) -> Result<String, String> {
        match timeout(self.call_timeout, self.summarizer.summarize(text)).await {
            Ok(Ok(summary)) if !summary.trim().is_empty() => Ok(summary),
            Ok(Ok(_)) => Err("summarizer returned an empty summary".into()),
            Ok(Err(error)) => Err(error.to_string()),
            Err(_) => Err(format!("summarizer timed out after {:?}", self.call_timeout)),
        }
    }
}

#[async_trait]
impl Stage for SummarizeStage {
    fn name(&self) -> &'static str {
        "summarize"
    }

    fn queue(&self) -> &'static str {
        SUMMARIZE_TASKS
    }

    async fn handle(&self, delivery: &Delivery) -> Result<StageOutcome, StageError> {
        let task: ExtractedText = decode(&delivery.body)?;
        tracing::info!(document_id = %task.document_id, "Summarizing document");

        let mut problems = Vec::new();
        let summary = match self.summarize(&task.text).await {
            Ok(summary) => summary,
            Err(reason) => {
                tracing::warn!(document_id = %task.document_id, error = %reason, "Summarizer failed; using fallback");
                problems.push(reason);
                FALLBACK_SUMMARY.to_string()
            }
        };

        let result = SummaryResult {
            document_id: task.document_id.clone(),
            summary,
        };
        publish_json(self.transport.as_ref(), SUMMARY_RESULTS, &result).await?;

        // The index is a read optimization; a lost refresh must not duplicate the result.
        let update = IndexRecord::summary_update(&task.document_id, result.summary);
        if let Err(error) = publish_json(self.transport.as_ref(), INDEX_TASKS, &update).await {
            tracing::warn!(document_id = %task.document_id, error = %error, "Index refresh not published");
            problems.push(format!("index refresh not published: {error}"));
        }

        if problems.is_empty() {
            tracing::info!(document_id = %task.document_id, "Summary published");
            Ok(StageOutcome::Completed)
        } else {
            Ok(StageOutcome::degraded(problems.join("; ")))
        }
    }
}
