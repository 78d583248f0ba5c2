//! Blob storage for uploaded documents and derived text.
//!
//! Uploads live under `<documentId>-<sanitizedFilename>`; OCR text is written to
//! `ocr/<documentId>.txt`. Writes overwrite, so repeated OCR attempts leave one text object.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Errors emitted by blob storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No object exists under the key.
    #[error("object not found: {0}")]
    NotFound(String),
    /// Key would escape the store root or is empty.
    #[error("invalid object key: {0}")]
    InvalidKey(String),
    /// Backend I/O failed.
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Opaque blob store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Fetch the uploaded bytes for a document.
    async fn get(&self, document_id: &str, filename: &str) -> Result<Vec<u8>, StoreError>;

    /// Write `bytes` under `key`, replacing any previous object.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError>;
}

/// Replace unsafe characters in the base name with `_`, preserving the extension.
pub fn sanitize_filename(filename: &str) -> String {
    if filename.is_empty() {
        return "unnamed".to_string();
    }
    let (base, ext) = split_extension(filename);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{cleaned}{ext}")
}

fn split_extension(filename: &str) -> (&str, &str) {
    match filename.rfind('.') {
        // A leading dot marks a hidden file, not an extension.
        Some(idx) if idx > 0 => filename.split_at(idx),
        _ => (filename, ""),
    }
}

/// Key of the uploaded object for a document.
pub fn object_name(document_id: &str, filename: &str) -> String {
    format!("{document_id}-{}", sanitize_filename(filename))
}

/// Key of the OCR text derived from a document.
pub fn text_key(document_id: &str) -> String {
    format!("ocr/{document_id}.txt")
}

/// Filesystem-backed store rooted at a directory.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Create a store rooted at `root`. The directory is created lazily on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !safe {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl Store for FsStore {
    async fn get(&self, document_id: &str, filename: &str) -> Result<Vec<u8>, StoreError> {
        let key = object_name(document_id, filename);
        let path = self.resolve(&key)?;
        match fs::read(&path).await {
            Ok(bytes) => {
                tracing::debug!(key = %key, bytes = bytes.len(), "Fetched object");
                Ok(bytes)
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key))
            }
            Err(error) => Err(StoreError::Io(error)),
        }
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        let path = self.resolve(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| StoreError::InvalidKey(key.to_string()))?;
        fs::create_dir_all(parent).await?;

        // Write to a sibling temp file, then rename over the target.
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| StoreError::InvalidKey(key.to_string()))?;
        let temp = parent.join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));
        let mut file = fs::File::create(&temp).await?;
        let written = async {
            file.write_all(&bytes).await?;
            file.sync_all().await
        }
        .await;
        drop(file);
        if let Err(error) = written {
            let _ = fs::remove_file(&temp).await;
            return Err(StoreError::Io(error));
        }
        if let Err(error) = fs::rename(&temp, &path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(StoreError::Io(error));
        }
        tracing::debug!(key, bytes = bytes.len(), "Stored object");
        Ok(())
    }
}

/// In-memory store used by tests and single-process runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read an object by its raw key.
    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, document_id: &str, filename: &str) -> Result<Vec<u8>, StoreError> {
        let key = object_name(document_id, filename);
        self.object(&key).ok_or(StoreError::NotFound(key))
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        if key.is_empty() {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), bytes);
        Ok(())
    }
}
