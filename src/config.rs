use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors encountered while loading configuration from environment variables.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable was not provided.
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),
    /// Environment variable contained a value that could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

/// Runtime configuration for the document pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Root directory of the filesystem blob store.
    pub storage_dir: PathBuf,
    /// Name of the search index maintained by the indexing stage.
    pub index_name: String,
    /// Handler invocations allowed in flight per stage.
    pub concurrency: usize,
    /// Delivery attempts before a transient failure is dead-lettered.
    pub max_attempts: u32,
    /// Upper bound applied to every collaborator call.
    pub call_timeout_secs: u64,
    /// Summarization backend used by the summarize stage.
    pub summarizer_provider: SummarizerProvider,
    /// Endpoint of the remote summarizer, required for the `http` provider.
    pub summarizer_url: Option<String>,
    /// Word budget of the extractive summarizer.
    pub summary_max_words: usize,
}

/// Supported summarization backends.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummarizerProvider {
    /// Local lead-sentence summarizer.
    Extractive,
    /// Remote JSON endpoint.
    Http,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("data"),
            index_name: "documents".to_string(),
            concurrency: 4,
            max_attempts: 3,
            call_timeout_secs: 30,
            summarizer_provider: SummarizerProvider::Extractive,
            summarizer_url: None,
            summary_max_words: 60,
        }
    }
}

impl Config {
    /// Load configuration from process environment variables, reading `.env` first when present.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config = Self::from_lookup(|key| env::var(key).ok())?;
        tracing::debug!(
            storage_dir = %config.storage_dir.display(),
            index = %config.index_name,
            concurrency = config.concurrency,
            max_attempts = config.max_attempts,
            summarizer = ?config.summarizer_provider,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Build configuration from an arbitrary key lookup, applying defaults for absent keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let optional = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let defaults = Self::default();

        let summarizer_provider = match optional("SUMMARIZER_PROVIDER") {
            Some(value) => value
                .parse()
                .map_err(|()| ConfigError::InvalidValue("SUMMARIZER_PROVIDER".to_string()))?,
            None => defaults.summarizer_provider,
        };
        let summarizer_url = optional("SUMMARIZER_URL");
        if summarizer_provider == SummarizerProvider::Http && summarizer_url.is_none() {
            return Err(ConfigError::MissingVariable("SUMMARIZER_URL".to_string()));
        }

        let concurrency: usize = parse_optional(&optional, "PIPELINE_CONCURRENCY")?
            .unwrap_or(defaults.concurrency);
        if concurrency == 0 {
            return Err(ConfigError::InvalidValue("PIPELINE_CONCURRENCY".to_string()));
        }
        let max_attempts: u32 = parse_optional(&optional, "PIPELINE_MAX_ATTEMPTS")?
            .unwrap_or(defaults.max_attempts);
        if max_attempts == 0 {
            return Err(ConfigError::InvalidValue("PIPELINE_MAX_ATTEMPTS".to_string()));
        }

        let call_timeout_secs: u64 = parse_optional(&optional, "PIPELINE_CALL_TIMEOUT_SECS")?
            .unwrap_or(defaults.call_timeout_secs);
        if call_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "PIPELINE_CALL_TIMEOUT_SECS".to_string(),
            ));
        }

        Ok(Self {
            storage_dir: optional("DOCPIPE_STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.storage_dir),
            index_name: optional("DOCPIPE_INDEX_NAME").unwrap_or(defaults.index_name),
            concurrency,
            max_attempts,
            call_timeout_secs,
            summarizer_provider,
            summarizer_url,
            summary_max_words: parse_optional(&optional, "SUMMARY_MAX_WORDS")?
                .unwrap_or(defaults.summary_max_words),
        })
    }

    /// Timeout applied to each extraction, summarization, store, and index call.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

fn parse_optional<T, F>(optional: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    optional(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue(key.to_string()))
        })
        .transpose()
}

impl std::str::FromStr for SummarizerProvider {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "extractive" => Ok(Self::Extractive),
            "http" => Ok(Self::Http),
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_environment_is_empty() {
        let config = Config::from_lookup(lookup(&[])).expect("config");
        assert_eq!(config.index_name, "documents");
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.summarizer_provider, SummarizerProvider::Extractive);
        assert_eq!(config.call_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn parses_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("DOCPIPE_STORAGE_DIR", "/tmp/blobs"),
            ("PIPELINE_CONCURRENCY", "8"),
            ("PIPELINE_MAX_ATTEMPTS", "5"),
            ("SUMMARIZER_PROVIDER", "HTTP"),
            ("SUMMARIZER_URL", "http://localhost:9000/summarize"),
        ]))
        .expect("config");
        assert_eq!(config.storage_dir, PathBuf::from("/tmp/blobs"));
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.summarizer_provider, SummarizerProvider::Http);
    }

    #[test]
    fn http_provider_requires_url() {
        let error = Config::from_lookup(lookup(&[("SUMMARIZER_PROVIDER", "http")])).unwrap_err();
        assert!(matches!(error, ConfigError::MissingVariable(key) if key == "SUMMARIZER_URL"));
    }

    #[test]
    fn rejects_zero_attempts_and_garbage_numbers() {
        let error = Config::from_lookup(lookup(&[("PIPELINE_MAX_ATTEMPTS", "0")])).unwrap_err();
        assert!(matches!(error, ConfigError::InvalidValue(_)));

        let error = Config::from_lookup(lookup(&[("PIPELINE_CONCURRENCY", "many")])).unwrap_err();
        assert!(matches!(error, ConfigError::InvalidValue(key) if key == "PIPELINE_CONCURRENCY"));
    }

    #[test]
    fn rejects_zero_call_timeout() {
        let error =
            Config::from_lookup(lookup(&[("PIPELINE_CALL_TIMEOUT_SECS", "0")])).unwrap_err();
        assert!(
            matches!(error, ConfigError::InvalidValue(key) if key == "PIPELINE_CALL_TIMEOUT_SECS")
        );

        let config =
            Config::from_lookup(lookup(&[("PIPELINE_CALL_TIMEOUT_SECS", "5")])).expect("config");
        assert_eq!(config.call_timeout(), Duration::from_secs(5));
    }
}
