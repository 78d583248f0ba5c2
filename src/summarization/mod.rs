//! Summarization providers.
//!
//! The summarize stage treats every provider as a fallible remote call: any error or empty
//! output is replaced by a fixed fallback text, so these clients never need their own
//! fallback logic. The extractive provider runs locally; the HTTP provider posts the text to
//! a JSON endpoint.

use crate::config::{Config, SummarizerProvider};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced while attempting summarization.
#[derive(Debug, Error)]
pub enum SummarizerError {
    /// Provider was misconfigured or unreachable.
    #[error("Summarization provider unavailable: {0}")]
    ProviderUnavailable(String),
    /// Provider returned an error response.
    #[error("Failed to generate summary: {0}")]
    GenerationFailed(String),
    /// Provider response could not be parsed.
    #[error("Malformed provider response: {0}")]
    InvalidResponse(String),
}

/// Text to short summary.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Summarize the full document text.
    async fn summarize(&self, text: &str) -> Result<String, SummarizerError>;
}

/// Build the summarizer selected by configuration.
pub fn build_summarizer(config: &Config) -> Result<Arc<dyn Summarizer>, SummarizerError> {
    match config.summarizer_provider {
        SummarizerProvider::Extractive => Ok(Arc::new(ExtractiveSummarizer::new(
            config.summary_max_words,
        ))),
        SummarizerProvider::Http => {
            let url = config.summarizer_url.clone().ok_or_else(|| {
                SummarizerError::ProviderUnavailable("SUMMARIZER_URL is not set".into())
            })?;
            Ok(Arc::new(HttpSummarizer::new(url)?))
        }
    }
}

/// Lead-sentence summarizer bounded by a word budget.
#[derive(Debug, Clone, Copy)]
pub struct ExtractiveSummarizer {
    max_words: usize,
}

impl ExtractiveSummarizer {
    /// Keep at most `max_words` words (minimum one).
    pub fn new(max_words: usize) -> Self {
        Self {
            max_words: max_words.max(1),
        }
    }

    fn summarize_sync(&self, text: &str) -> Option<String> {
        let words: Vec<&str> = text.split_whitespace().collect();
        if words.is_empty() {
            return None;
        }

        let mut kept = 0;
        let mut sentence_end = 0;
        for (idx, word) in words.iter().enumerate() {
            if idx >= self.max_words {
                break;
            }
            kept = idx + 1;
            if ends_sentence(word) {
                sentence_end = kept;
            }
        }
        // Prefer whole sentences; fall back to a truncated first sentence.
        let take = if sentence_end > 0 { sentence_end } else { kept };

        let mut summary = words[..take].join(" ");
        if !ends_sentence(&summary) {
            summary = summary
                .trim_end_matches([',', ';', ':', '-'])
                .to_string();
            summary.push('.');
        }
        Some(summary)
    }
}

fn ends_sentence(word: &str) -> bool {
    word.trim_end_matches(['"', '\'', ')'])
        .ends_with(['.', '!', '?'])
}

#[async_trait]
impl Summarizer for ExtractiveSummarizer {
    async fn summarize(&self, text: &str) -> Result<String, SummarizerError> {
        self.summarize_sync(text)
            .ok_or_else(|| SummarizerError::GenerationFailed("no text to summarize".into()))
    }
}

/// Client for a remote summarization endpoint.
///
/// Sends `{"text": ...}` and expects `{"summary": ...}` back.
pub struct HttpSummarizer {
    http: Client,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct SummaryResponse {
    summary: String,
}

impl HttpSummarizer {
    /// Construct a client targeting `endpoint`.
    pub fn new(endpoint: String) -> Result<Self, SummarizerError> {
        let http = Client::builder()
            .user_agent("docpipe/summary")
            .build()
            .map_err(|error| SummarizerError::ProviderUnavailable(error.to_string()))?;
        Ok(Self { http, endpoint })
    }
}

#[async_trait]
impl Summarizer for HttpSummarizer {
    async fn summarize(&self, text: &str) -> Result<String, SummarizerError> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(&json!({ "text": text }))
            .send()
            .await
            .map_err(|error| {
                SummarizerError::ProviderUnavailable(format!(
                    "failed to reach summarizer at {}: {error}",
                    self.endpoint
                ))
            })?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(SummarizerError::ProviderUnavailable(format!(
                "summarizer endpoint {} returned 404",
                self.endpoint
            )));
        }

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SummarizerError::GenerationFailed(format!(
                "summarizer returned {status}: {body}"
            )));
        }

        let body: SummaryResponse = response.json().await.map_err(|error| {
            SummarizerError::InvalidResponse(format!("failed to decode summary response: {error}"))
        })?;

        let summary = body.summary.trim();
        if summary.is_empty() {
            return Err(SummarizerError::InvalidResponse("empty summary".into()));
        }
        Ok(summary.to_string())
    }
}
