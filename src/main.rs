use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use docpipe::config::Config;
use docpipe::extraction::PlainTextExtractor;
use docpipe::index::{MemoryIndex, SearchHit};
use docpipe::logging;
use docpipe::messages::{DeadLetter, IndexRecord, SummaryResult, UploadEvent, encode};
use docpipe::metrics::MetricsSnapshot;
use docpipe::pipeline::{
    Collaborators, Pipeline, PipelineSettings, STAGE_QUEUES, SUMMARY_RESULTS, UPLOAD_EVENTS,
    dead_letter_queue,
};
use docpipe::store::{FsStore, Store, object_name};
use docpipe::summarization::build_summarizer;
use docpipe::transport::{InMemoryBroker, Transport};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Parser)]
#[command(
    name = "docpipe",
    about = "Run documents through OCR, summarization, and indexing"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Upload files, process them through every stage, and print the results as JSON.
    Process {
        /// Files to upload.
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Content type recorded on every upload event.
        #[arg(long)]
        content_type: Option<String>,
        /// Search the index once processing settles.
        #[arg(long)]
        query: Option<String>,
        /// Maximum number of search hits.
        #[arg(long, default_value_t = 10)]
        limit: usize,
        /// Give up waiting for the queues to drain after this many seconds.
        #[arg(long, default_value_t = 300)]
        wait_secs: u64,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Report {
    summaries: Vec<SummaryResult>,
    dead_letters: BTreeMap<String, Vec<DeadLetter>>,
    documents: Vec<IndexRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hits: Option<Vec<SearchHit>>,
    metrics: BTreeMap<&'static str, MetricsSnapshot>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // `.env` may carry RUST_LOG and DOCPIPE_LOG_FILE, so load it before tracing starts.
    dotenvy::dotenv().ok();
    logging::init_tracing();
    let config = Config::from_env().context("failed to load configuration")?;

    let cli = Cli::parse();
    match cli.command {
        Command::Process {
            files,
            content_type,
            query,
            limit,
            wait_secs,
        } => {
            let report = process(
                &config,
                &files,
                content_type,
                query.as_deref(),
                limit,
                Duration::from_secs(wait_secs),
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}

async fn process(
    config: &Config,
    files: &[PathBuf],
    content_type: Option<String>,
    query: Option<&str>,
    limit: usize,
    wait: Duration,
) -> Result<Report> {
    let store = Arc::new(FsStore::new(config.storage_dir.clone()));
    let broker = InMemoryBroker::new();
    let index = Arc::new(MemoryIndex::new());
    let summarizer = build_summarizer(config).context("failed to build summarizer")?;

    let collaborators = Collaborators {
        store: store.clone(),
        extractor: Arc::new(PlainTextExtractor::new()),
        summarizer,
        indexer: index.clone(),
    };
    let pipeline = Pipeline::start(
        Arc::new(broker.clone()),
        collaborators,
        PipelineSettings::from(config),
    )
    .await
    .context("failed to start pipeline")?;

    for path in files {
        upload(store.as_ref(), &broker, path, content_type.clone()).await?;
    }

    let settled = tokio::time::timeout(wait, async {
        while !broker.is_idle(&STAGE_QUEUES) {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await;
    let metrics = pipeline.shutdown().await;
    if settled.is_err() {
        bail!("queues did not drain within {wait:?}");
    }

    let summaries = broker
        .drain(SUMMARY_RESULTS)?
        .iter()
        .map(|body| serde_json::from_slice(body))
        .collect::<Result<Vec<SummaryResult>, _>>()
        .context("malformed summary result")?;
    let mut dead_letters = BTreeMap::new();
    for queue in STAGE_QUEUES {
        let dlq = dead_letter_queue(queue);
        let letters = broker
            .drain(&dlq)?
            .iter()
            .map(|body| serde_json::from_slice(body))
            .collect::<Result<Vec<DeadLetter>, _>>()
            .context("malformed dead letter")?;
        if !letters.is_empty() {
            dead_letters.insert(dlq, letters);
        }
    }

    Ok(Report {
        summaries,
        dead_letters,
        documents: index.documents(&config.index_name),
        hits: query.map(|query| index.search(&config.index_name, query, limit)),
        metrics,
    })
}

async fn upload(
    store: &dyn Store,
    broker: &InMemoryBroker,
    path: &Path,
    content_type: Option<String>,
) -> Result<()> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("{} has no usable file name", path.display()))?
        .to_string();
    let document_id = Uuid::new_v4().to_string();

    let size = bytes.len() as u64;
    store
        .put(&object_name(&document_id, &filename), bytes)
        .await
        .with_context(|| format!("failed to store {filename}"))?;

    let event = UploadEvent {
        document_id: document_id.clone(),
        filename,
        content_type,
        uploaded_at: Some(OffsetDateTime::now_utc()),
        size: Some(size),
    };
    broker.publish(UPLOAD_EVENTS, encode(&event)?).await?;
    tracing::info!(document_id = %document_id, filename = %event.filename, size, "Upload published");
    Ok(())
}
