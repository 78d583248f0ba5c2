//! Text extraction from uploaded documents.
//!
//! Extractors return pages; [`extract_text`] joins them in page order with
//! [`PAGE_SEPARATOR`], dropping blank pages.

use async_trait::async_trait;
use thiserror::Error;

/// Separator placed between consecutive pages of extracted text.
pub const PAGE_SEPARATOR: &str = "\n\n";

/// Errors raised by text extractors.
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// Input format cannot be read by this extractor.
    #[error("unsupported content: {0}")]
    Unsupported(String),
    /// Extraction engine failed or was unreachable.
    #[error("extraction engine failed: {0}")]
    Engine(String),
}

/// OCR engine capability: document bytes to per-page text.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    /// Extract the text of every page, in page order.
    async fn extract_pages(&self, bytes: &[u8]) -> Result<Vec<String>, ExtractionError>;
}

/// Run an extractor and concatenate its pages.
pub async fn extract_text(
    extractor: &dyn TextExtractor,
    bytes: &[u8],
) -> Result<String, ExtractionError> {
    let pages = extractor.extract_pages(bytes).await?;
    let page_count = pages.len();
    let text = join_pages(pages);
    tracing::debug!(pages = page_count, chars = text.len(), "Extracted text");
    Ok(text)
}

fn join_pages(pages: Vec<String>) -> String {
    pages
        .iter()
        .map(|page| page.trim())
        .filter(|page| !page.is_empty())
        .collect::<Vec<_>>()
        .join(PAGE_SEPARATOR)
}

/// Extractor for UTF-8 text documents whose pages are separated by form feeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainTextExtractor;

impl PlainTextExtractor {
    /// Construct the extractor.
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TextExtractor for PlainTextExtractor {
    async fn extract_pages(&self, bytes: &[u8]) -> Result<Vec<String>, ExtractionError> {
        let text = std::str::from_utf8(bytes).map_err(|error| {
            ExtractionError::Unsupported(format!("document is not UTF-8 text: {error}"))
        })?;
        Ok(text
            .replace("\r\n", "\n")
            .split('\u{000C}')
            .map(str::to_string)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedPages(Vec<&'static str>);

    #[async_trait]
    impl TextExtractor for FixedPages {
        async fn extract_pages(&self, _bytes: &[u8]) -> Result<Vec<String>, ExtractionError> {
            Ok(self.0.iter().map(|page| page.to_string()).collect())
        }
    }

    #[tokio::test]
    async fn pages_are_joined_in_order_with_separator() {
        let extractor = FixedPages(vec!["first page\n", "  ", "second page", "third"]);
        let text = extract_text(&extractor, b"").await.expect("text");
        assert_eq!(text, "first page\n\nsecond page\n\nthird");
    }

    #[tokio::test]
    async fn plain_text_splits_on_form_feed() {
        let text = extract_text(&PlainTextExtractor::new(), b"Hello\r\nworld\x0cPage two")
            .await
            .expect("text");
        assert_eq!(text, "Hello\nworld\n\nPage two");
    }

    #[tokio::test]
    async fn blank_documents_yield_empty_text() {
        let text = extract_text(&PlainTextExtractor::new(), b" \n\x0c\n")
            .await
            .expect("text");
        assert!(text.is_empty());
    }

    #[tokio::test]
    async fn binary_input_is_unsupported() {
        let error = extract_text(&PlainTextExtractor::new(), &[0xff, 0xfe, 0x00])
            .await
            .unwrap_err();
        assert!(matches!(error, ExtractionError::Unsupported(_)));
    }
}
