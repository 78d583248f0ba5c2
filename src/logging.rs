//! Tracing configuration and log routing.
//!
//! Console logs go to stderr with a compact formatter so the JSON report printed on stdout
//! stays machine-readable. File logging is optional: `DOCPIPE_LOG_FILE` names the file to
//! append to, `off` disables it, and when unset logs go to `logs/docpipe.log`. The file layer
//! uses a non‑blocking writer so stage handlers never wait on file I/O.
use std::path::PathBuf;
use std::sync::OnceLock;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const LOG_FILE_VAR: &str = "DOCPIPE_LOG_FILE";
const DEFAULT_LOG_DIR: &str = "logs";
const DEFAULT_LOG_NAME: &str = "docpipe.log";

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Where file logs are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogFile {
    /// No file layer.
    Disabled,
    /// Append to an explicit path.
    Append(PathBuf),
    /// `logs/docpipe.log`, creating the directory when needed.
    Default,
}

impl LogFile {
    /// Resolve the file target from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        match lookup(LOG_FILE_VAR).map(|value| value.trim().to_string()) {
            None => Self::Default,
            Some(value) if value.is_empty() => Self::Default,
            Some(value) if matches!(value.to_ascii_lowercase().as_str(), "off" | "none") => {
                Self::Disabled
            }
            Some(value) => Self::Append(PathBuf::from(value)),
        }
    }
}

/// Configure tracing subscribers for stderr and optional file logging.
///
/// - Respects `RUST_LOG` for filtering (defaults to `info`).
/// - Keeps the non‑blocking writer alive for the process lifetime through a global guard.
/// - A second call leaves the first subscriber in place.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact();

    let file_layer = configure_file_writer(LogFile::from_lookup(|key| std::env::var(key).ok()))
        .map(|writer| {
            fmt::layer()
                .with_writer(writer)
                .with_target(true)
                .with_ansi(false)
                .compact()
        });

    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();
    if let Err(err) = installed {
        eprintln!("Tracing already initialised: {err}");
    }
}

/// Build a non‑blocking writer for `target`.
///
/// Returns `None` when file logging is disabled or the file cannot be opened.
fn configure_file_writer(target: LogFile) -> Option<NonBlocking> {
    let (non_blocking, guard) = match target {
        LogFile::Disabled => return None,
        LogFile::Append(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|err| eprintln!("Failed to open log file {}: {err}", path.display()))
                .ok()?;
            tracing_appender::non_blocking(file)
        }
        LogFile::Default => {
            if let Err(err) = std::fs::create_dir_all(DEFAULT_LOG_DIR) {
                eprintln!("Failed to create {DEFAULT_LOG_DIR} directory: {err}");
                return None;
            }
            tracing_appender::non_blocking(tracing_appender::rolling::never(
                DEFAULT_LOG_DIR,
                DEFAULT_LOG_NAME,
            ))
        }
    };
    let _ = LOG_GUARD.set(guard);
    Some(non_blocking)
}
