//! Stage orchestration.
//!
//! Each stage consumes exactly one queue, transforms the message with its collaborators, and
//! publishes follow-on messages:
//!
//! ```text
//! upload-events   -> [ocr]       -> summarize-tasks, index-tasks
//! summarize-tasks -> [summarize] -> summary-results, index-tasks
//! index-tasks     -> [index]     -> (terminal)
//! ```
//!
//! Handlers never settle deliveries themselves. They return a [`StageOutcome`] or a
//! [`StageError`], and the [`StageRunner`] turns that into an ack, a requeue, or a
//! dead-letter according to the [`RetryPolicy`].

use crate::messages::{MessageError, encode};
use crate::transport::{Delivery, QueueSpec, Transport, TransportError};
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

/// Index stage.
pub mod indexing;
/// OCR stage.
pub mod ocr;
pub mod retry;
pub mod runner;
/// Summarize stage.
pub mod summarize;

pub use indexing::IndexStage;
pub use ocr::OcrStage;
pub use retry::{Disposition, RetryPolicy};
pub use runner::{Collaborators, Pipeline, PipelineSettings, StageRunner};
pub use summarize::{FALLBACK_SUMMARY, SummarizeStage};

/// Upload notifications consumed by the OCR stage.
pub const UPLOAD_EVENTS: &str = "upload-events";
/// Extracted text consumed by the summarize stage.
pub const SUMMARIZE_TASKS: &str = "summarize-tasks";
/// Index records consumed by the indexing stage.
pub const INDEX_TASKS: &str = "index-tasks";
/// Summaries published for consumers outside the pipeline.
pub const SUMMARY_RESULTS: &str = "summary-results";

/// Queues consumed by a pipeline stage.
pub const STAGE_QUEUES: [&str; 3] = [UPLOAD_EVENTS, SUMMARIZE_TASKS, INDEX_TASKS];

/// Dead-letter queue paired with a stage queue.
pub fn dead_letter_queue(queue: &str) -> String {
    format!("{queue}.dlq")
}

/// Declare every pipeline queue. Stage queues get a dead-letter queue each.
pub async fn declare_topology(transport: &dyn Transport) -> Result<(), TransportError> {
    for queue in STAGE_QUEUES {
        let dlq = dead_letter_queue(queue);
        transport.declare(QueueSpec::durable(dlq.clone())).await?;
        transport
            .declare(QueueSpec::durable(queue).with_dead_letter(dlq))
            .await?;
    }
    transport.declare(QueueSpec::durable(SUMMARY_RESULTS)).await?;
    tracing::debug!("Pipeline queues declared");
    Ok(())
}

/// How a handler disposed of a message it could process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// All required work and publishes succeeded.
    Completed,
    /// A collaborator produced no usable output and the stage absorbed it with a fallback or
    /// by publishing nothing. The message is still acknowledged.
    Degraded {
        /// What went wrong.
        reason: String,
    },
}

impl StageOutcome {
    /// Shorthand for a degraded outcome.
    pub fn degraded(reason: impl Into<String>) -> Self {
        Self::Degraded {
            reason: reason.into(),
        }
    }
}

/// Failures a handler cannot absorb.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StageError {
    /// Infrastructure was unreachable or too slow; retrying may succeed.
    #[error("transient failure: {0}")]
    Transient(String),
    /// The message itself is unusable; retrying cannot succeed.
    #[error("invalid message: {0}")]
    Structural(String),
}

impl From<MessageError> for StageError {
    fn from(error: MessageError) -> Self {
        Self::Structural(error.to_string())
    }
}

impl From<TransportError> for StageError {
    fn from(error: TransportError) -> Self {
        Self::Transient(format!("publish failed: {error}"))
    }
}

/// One pipeline step bound to one input queue.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Short name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Queue this stage consumes.
    fn queue(&self) -> &'static str;

    /// Process a single delivery. Must be idempotent per document id.
    async fn handle(&self, delivery: &Delivery) -> Result<StageOutcome, StageError>;
}

async fn publish_json<T: Serialize + Sync>(
    transport: &dyn Transport,
    queue: &str,
    record: &T,
) -> Result<(), StageError> {
    let body = encode(record)
        .map_err(|error| StageError::Structural(format!("unencodable record: {error}")))?;
    transport.publish(queue, body).await?;
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryBroker;

    #[tokio::test]
    async fn topology_declares_stage_and_dead_letter_queues() {
        let broker = InMemoryBroker::new();
        declare_topology(&broker).await.expect("declare");
        declare_topology(&broker).await.expect("redeclare is a no-op");

        for queue in STAGE_QUEUES {
            assert_eq!(broker.depth(queue).unwrap(), 0);
            assert_eq!(broker.depth(&dead_letter_queue(queue)).unwrap(), 0);
        }
        assert_eq!(broker.depth(SUMMARY_RESULTS).unwrap(), 0);
    }

    #[test]
    fn message_errors_are_structural() {
        let error = crate::messages::decode::<crate::messages::UploadEvent>(b"{}").unwrap_err();
        assert!(matches!(StageError::from(error), StageError::Structural(_)));
    }

    #[test]
    fn publish_errors_are_transient() {
        let error = StageError::from(TransportError::Closed);
        assert!(matches!(error, StageError::Transient(message) if message.contains("closed")));
    }
}
