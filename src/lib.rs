#![deny(missing_docs)]

//! Core library for the docpipe document pipeline.
//!
//! Uploaded documents flow through three queue-driven stages: OCR, summarization, and search
//! indexing. Transient infrastructure failures are retried a bounded number of times before the
//! message is dead-lettered; messages that can never succeed are dead-lettered immediately.

/// Environment-driven configuration management.
pub mod config;
/// Text extraction (OCR) collaborators.
pub mod extraction;
/// Search index abstraction and the in-process index.
pub mod index;
/// Structured logging and tracing setup.
pub mod logging;
/// Queue message records and their JSON codec.
pub mod messages;
/// Per-stage delivery counters.
pub mod metrics;
/// Stage handlers, retry policy, and the runner that drives them.
pub mod pipeline;
/// Blob storage for uploads and extracted text.
pub mod store;
/// Summarization backends.
pub mod summarization;
/// Message transport abstraction and the in-memory broker.
pub mod transport;
