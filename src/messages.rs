//! Records exchanged between pipeline stages.
//!
//! Bodies are JSON with camelCase field names. Unknown fields are ignored on decode so
//! producers can add fields without breaking older consumers.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

/// Errors raised while decoding a message body.
#[derive(Debug, Error)]
pub enum MessageError {
    /// Body was not valid JSON for the expected record.
    #[error("malformed message body: {0}")]
    Malformed(#[from] serde_json::Error),
    /// Required field was absent or blank.
    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

/// Emitted once per uploaded document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadEvent {
    /// Join key carried unchanged through every stage.
    pub document_id: String,
    /// Original filename as supplied by the uploader.
    pub filename: String,
    /// MIME type reported at upload.
    #[serde(default)]
    pub content_type: Option<String>,
    /// Upload time.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub uploaded_at: Option<OffsetDateTime>,
    /// Size of the uploaded blob in bytes.
    #[serde(default)]
    pub size: Option<u64>,
}

/// OCR output handed to the summarize stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedText {
    /// Document the text belongs to.
    pub document_id: String,
    /// Full extracted text, pages in order.
    pub text: String,
}

/// Summary published for external consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryResult {
    /// Document the summary belongs to.
    pub document_id: String,
    /// Generated summary or the fallback text.
    pub summary: String,
}

/// Searchable document entry. Every field except the id is optional so that partial
/// updates (summary only, OCR only) merge into the stored record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexRecord {
    /// Upsert key.
    pub document_id: String,
    /// Original filename.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// MIME type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Upload time.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub uploaded_at: Option<OffsetDateTime>,
    /// Blob size in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Extracted text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Summary; may arrive later than the text or never.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl IndexRecord {
    /// Build the OCR-side record: upload metadata plus text, summary absent.
    pub fn from_upload(event: &UploadEvent, text: String) -> Self {
        Self {
            document_id: event.document_id.clone(),
            filename: Some(event.filename.clone()),
            content_type: event.content_type.clone(),
            uploaded_at: event.uploaded_at,
            size: event.size,
            text: Some(text),
            summary: None,
        }
    }

    /// Build a summary-only update.
    pub fn summary_update(document_id: &str, summary: String) -> Self {
        Self {
            document_id: document_id.to_string(),
            summary: Some(summary),
            ..Self::default()
        }
    }

    /// Overwrite fields present in `update`, keeping stored values for absent ones.
    pub fn merge(&mut self, update: IndexRecord) {
        if update.filename.is_some() {
            self.filename = update.filename;
        }
        if update.content_type.is_some() {
            self.content_type = update.content_type;
        }
        if update.uploaded_at.is_some() {
            self.uploaded_at = update.uploaded_at;
        }
        if update.size.is_some() {
            self.size = update.size;
        }
        if update.text.is_some() {
            self.text = update.text;
        }
        if update.summary.is_some() {
            self.summary = update.summary;
        }
    }
}

/// Record routed to a dead-letter queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    /// Original body, parsed as JSON when possible and kept as a string otherwise.
    pub original_message: serde_json::Value,
    /// Queue the message was consumed from.
    pub stage: String,
    /// Why the message could not be processed.
    pub reason: String,
    /// When the message was dead-lettered.
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// Delivery attempts made before giving up.
    pub attempts: u32,
}

impl DeadLetter {
    /// Wrap a raw body for the dead-letter queue.
    pub fn new(body: &[u8], stage: &str, reason: &str, attempts: u32) -> Self {
        let original_message = serde_json::from_slice(body).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(body).into_owned())
        });
        Self {
            original_message,
            stage: stage.to_string(),
            reason: reason.to_string(),
            timestamp: OffsetDateTime::now_utc(),
            attempts,
        }
    }
}

/// Messages that carry the pipeline join key.
pub trait Keyed {
    /// The document identifier.
    fn document_id(&self) -> &str;
}

macro_rules! impl_keyed {
    ($($record:ty),*) => {
        $(impl Keyed for $record {
            fn document_id(&self) -> &str {
                &self.document_id
            }
        })*
    };
}

impl_keyed!(UploadEvent, ExtractedText, SummaryResult, IndexRecord);

/// Decode a body and reject records whose `documentId` is blank.
pub fn decode<T>(body: &[u8]) -> Result<T, MessageError>
where
    T: DeserializeOwned + Keyed,
{
    let record: T = serde_json::from_slice(body)?;
    if record.document_id().trim().is_empty() {
        return Err(MessageError::MissingField("documentId"));
    }
    Ok(record)
}

/// Serialize a record for publishing.
pub fn encode<T: Serialize>(record: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(record)
}
