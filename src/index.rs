//! Search index abstraction and the in-process index.

use crate::messages::IndexRecord;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Errors returned by indexers.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Backend could not be reached.
    #[error("index backend unavailable: {0}")]
    Unavailable(String),
    /// Index creation lost a race or repeated an earlier creation.
    #[error("index already exists: {0}")]
    AlreadyExists(String),
    /// Write targeted an index that was never created.
    #[error("index not found: {0}")]
    MissingIndex(String),
    /// Backend refused the record.
    #[error("record rejected: {0}")]
    Rejected(String),
}

/// Field types supported by the document schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// Exact-match term.
    Keyword,
    /// Full-text field.
    Text,
    /// Full-text field with an exact-match sub-field.
    TextWithKeyword,
    /// Timestamp.
    Date,
    /// Integer.
    Integer,
}

/// Field layout of an index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexSchema {
    /// Field names with their types.
    pub fields: Vec<(String, FieldType)>,
}

/// Fixed schema of the document index.
pub fn document_schema() -> IndexSchema {
    let fields = [
        ("documentId", FieldType::Keyword),
        ("filename", FieldType::TextWithKeyword),
        ("contentType", FieldType::Keyword),
        ("uploadedAt", FieldType::Date),
        ("size", FieldType::Integer),
        ("text", FieldType::Text),
        ("summary", FieldType::Text),
    ];
    IndexSchema {
        fields: fields
            .into_iter()
            .map(|(name, kind)| (name.to_string(), kind))
            .collect(),
    }
}

/// Searchable document store keyed by document id.
#[async_trait]
pub trait Indexer: Send + Sync {
    /// Whether `index` exists.
    async fn index_exists(&self, index: &str) -> Result<bool, IndexError>;

    /// Create `index`; fails with [`IndexError::AlreadyExists`] when it is present.
    async fn create_index(&self, index: &str, schema: &IndexSchema) -> Result<(), IndexError>;

    /// Insert or merge `record` under `document_id`.
    async fn upsert(
        &self,
        index: &str,
        document_id: &str,
        record: IndexRecord,
    ) -> Result<(), IndexError>;

    /// Create the document index when missing. Safe to race: losing a concurrent creation
    /// counts as success.
    async fn ensure_schema(&self, index: &str) -> Result<(), IndexError> {
        if self.index_exists(index).await? {
            return Ok(());
        }

        tracing::debug!(index, "Creating index");
        match self.create_index(index, &document_schema()).await {
            Ok(()) => {
                tracing::info!(index, "Index created");
                Ok(())
            }
            Err(IndexError::AlreadyExists(_)) => {
                tracing::debug!(index, "Index created concurrently");
                Ok(())
            }
            Err(error) => Err(error),
        }
    }
}

/// Scored match returned by [`MemoryIndex::search`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    /// Matching document.
    pub document_id: String,
    /// Filename, when indexed.
    pub filename: Option<String>,
    /// Relevance score.
    pub score: f32,
    /// Short excerpt for display.
    pub snippet: String,
}

const SNIPPET_CHARS: usize = 160;

struct StoredIndex {
    schema: IndexSchema,
    documents: HashMap<String, IndexRecord>,
}

/// In-process index with merge upserts and term search.
#[derive(Default)]
pub struct MemoryIndex {
    indexes: Mutex<HashMap<String, StoredIndex>>,
    creations: AtomicUsize,
}

impl MemoryIndex {
    /// Create an index store with no indexes.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, StoredIndex>> {
        self.indexes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of successful index creations since startup.
    pub fn creation_count(&self) -> usize {
        self.creations.load(Ordering::SeqCst)
    }

    /// Schema of `index`, if created.
    pub fn schema(&self, index: &str) -> Option<IndexSchema> {
        self.lock().get(index).map(|stored| stored.schema.clone())
    }

    /// Stored record for a document.
    pub fn document(&self, index: &str, document_id: &str) -> Option<IndexRecord> {
        self.lock()
            .get(index)
            .and_then(|stored| stored.documents.get(document_id).cloned())
    }

    /// All stored records, ordered by document id.
    pub fn documents(&self, index: &str) -> Vec<IndexRecord> {
        let mut records: Vec<IndexRecord> = self
            .lock()
            .get(index)
            .map(|stored| stored.documents.values().cloned().collect())
            .unwrap_or_default();
        records.sort_by(|a, b| a.document_id.cmp(&b.document_id));
        records
    }

    /// Case-insensitive term search over filename, summary, and text.
    pub fn search(&self, index: &str, query: &str, limit: usize) -> Vec<SearchHit> {
        let terms: Vec<String> = query
            .split_whitespace()
            .map(|term| term.to_lowercase())
            .collect();
        if terms.is_empty() {
            return Vec::new();
        }

        let mut hits: Vec<SearchHit> = self
            .documents(index)
            .into_iter()
            .filter_map(|record| {
                let score = field_score(record.filename.as_deref(), &terms) * 2.0
                    + field_score(record.summary.as_deref(), &terms) * 1.5
                    + field_score(record.text.as_deref(), &terms);
                (score > 0.0).then(|| SearchHit {
                    snippet: snippet(&record),
                    document_id: record.document_id,
                    filename: record.filename,
                    score,
                })
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit);
        hits
    }
}

fn field_score(value: Option<&str>, terms: &[String]) -> f32 {
    let Some(value) = value else {
        return 0.0;
    };
    let haystack = value.to_lowercase();
    terms
        .iter()
        .map(|term| haystack.matches(term.as_str()).count() as f32)
        .sum()
}

fn snippet(record: &IndexRecord) -> String {
    let source = record
        .summary
        .as_deref()
        .filter(|summary| !summary.trim().is_empty())
        .or(record.text.as_deref())
        .unwrap_or_default();
    let mut excerpt: String = source.chars().take(SNIPPET_CHARS).collect();
    if source.chars().count() > SNIPPET_CHARS {
        excerpt.push('…');
    }
    excerpt
}

#[async_trait]
impl Indexer for MemoryIndex {
    async fn index_exists(&self, index: &str) -> Result<bool, IndexError> {
        Ok(self.lock().contains_key(index))
    }

    async fn create_index(&self, index: &str, schema: &IndexSchema) -> Result<(), IndexError> {
        let mut indexes = self.lock();
        if indexes.contains_key(index) {
            return Err(IndexError::AlreadyExists(index.to_string()));
        }
        indexes.insert(
            index.to_string(),
            StoredIndex {
                schema: schema.clone(),
                documents: HashMap::new(),
            },
        );
        self.creations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn upsert(
        &self,
        index: &str,
        document_id: &str,
        record: IndexRecord,
    ) -> Result<(), IndexError> {
        if record.document_id != document_id {
            return Err(IndexError::Rejected(format!(
                "record id {} does not match key {document_id}",
                record.document_id
            )));
        }
        let mut indexes = self.lock();
        let stored = indexes
            .get_mut(index)
            .ok_or_else(|| IndexError::MissingIndex(index.to_string()))?;
        match stored.documents.get_mut(document_id) {
            Some(existing) => existing.merge(record),
            None => {
                stored.documents.insert(document_id.to_string(), record);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::join_all;
    use std::sync::Arc;

    fn record(id: &str, text: Option<&str>, summary: Option<&str>) -> IndexRecord {
        IndexRecord {
            document_id: id.into(),
            filename: Some(format!("{id}.pdf")),
            text: text.map(str::to_string),
            summary: summary.map(str::to_string),
            ..IndexRecord::default()
        }
    }

    #[tokio::test]
    async fn ensure_schema_is_idempotent() {
        let index = MemoryIndex::new();
        index.ensure_schema("documents").await.expect("first");
        index.ensure_schema("documents").await.expect("second");
        assert_eq!(index.creation_count(), 1);
        assert_eq!(index.schema("documents"), Some(document_schema()));
    }

    #[tokio::test]
    async fn concurrent_ensure_schema_creates_one_index() {
        let index = Arc::new(MemoryIndex::new());
        let attempts = (0..16).map(|_| {
            let index = index.clone();
            tokio::spawn(async move { index.ensure_schema("documents").await })
        });
        for outcome in join_all(attempts).await {
            outcome.expect("task").expect("ensure_schema");
        }
        assert_eq!(index.creation_count(), 1);
    }

    #[tokio::test]
    async fn create_index_reports_existing() {
        let index = MemoryIndex::new();
        index.create_index("documents", &document_schema()).await.unwrap();
        let error = index
            .create_index("documents", &document_schema())
            .await
            .unwrap_err();
        assert!(matches!(error, IndexError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn later_summary_wins_and_keeps_one_record() {
        let index = MemoryIndex::new();
        index.ensure_schema("documents").await.unwrap();
        index
            .upsert("documents", "d1", record("d1", Some("Hello"), Some("first")))
            .await
            .unwrap();
        index
            .upsert("documents", "d1", record("d1", None, Some("second")))
            .await
            .unwrap();

        let docs = index.documents("documents");
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].summary.as_deref(), Some("second"));
        assert_eq!(docs[0].text.as_deref(), Some("Hello"));
    }

    #[tokio::test]
    async fn upsert_requires_index_and_matching_id() {
        let index = MemoryIndex::new();
        let error = index
            .upsert("documents", "d1", record("d1", None, None))
            .await
            .unwrap_err();
        assert!(matches!(error, IndexError::MissingIndex(_)));

        index.ensure_schema("documents").await.unwrap();
        let error = index
            .upsert("documents", "d2", record("d1", None, None))
            .await
            .unwrap_err();
        assert!(matches!(error, IndexError::Rejected(_)));
    }

    #[tokio::test]
    async fn search_ranks_filename_and_summary_matches() {
        let index = MemoryIndex::new();
        index.ensure_schema("documents").await.unwrap();
        index
            .upsert("documents", "a", record("a", Some("quarterly invoice totals"), None))
            .await
            .unwrap();
        index
            .upsert("documents", "invoice", record("invoice", Some("misc"), Some("An invoice.")))
            .await
            .unwrap();
        index
            .upsert("documents", "c", record("c", Some("unrelated"), None))
            .await
            .unwrap();

        let hits = index.search("documents", "Invoice", 10);
        let ids: Vec<_> = hits.iter().map(|hit| hit.document_id.as_str()).collect();
        assert_eq!(ids, vec!["invoice", "a"]);
        assert_eq!(hits[0].snippet, "An invoice.");
        assert!(index.search("documents", "   ", 10).is_empty());
    }
}
