//! Delivery loop shared by every stage.

use super::{
    Disposition, IndexStage, OcrStage, RetryPolicy, Stage, StageError, StageOutcome,
    SummarizeStage, declare_topology,
};
use crate::config::Config;
use crate::extraction::TextExtractor;
use crate::index::Indexer;
use crate::metrics::{MetricsSnapshot, StageMetrics};
use crate::store::Store;
use crate::summarization::Summarizer;
use crate::transport::{Delivery, Transport, TransportError};
use futures_util::FutureExt;
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};

/// Consumes one stage queue and settles every delivery according to a [`RetryPolicy`].
///
/// Up to `concurrency` handler invocations run at once; each runs on its own task so slow
/// collaborator calls never block delivery to the others.
pub struct StageRunner {
    stage: Arc<dyn Stage>,
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    concurrency: usize,
    metrics: Arc<StageMetrics>,
}

impl StageRunner {
    /// Create a runner for `stage`.
    pub fn new(
        stage: Arc<dyn Stage>,
        transport: Arc<dyn Transport>,
        policy: RetryPolicy,
        concurrency: usize,
    ) -> Self {
        Self {
            stage,
            transport,
            policy,
            concurrency: concurrency.max(1),
            metrics: Arc::new(StageMetrics::new()),
        }
    }

    /// Counters updated as deliveries are settled.
    pub fn metrics(&self) -> Arc<StageMetrics> {
        self.metrics.clone()
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped) or the transport
    /// closes. In-flight handlers are awaited before returning.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), TransportError> {
        let stage_name = self.stage.name();
        let queue = self.stage.queue();
        let mut consumer = self.transport.consume(queue).await?;
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut in_flight = JoinSet::new();
        tracing::info!(
            stage = stage_name,
            queue,
            concurrency = self.concurrency,
            "Stage started"
        );

        loop {
            let permit = tokio::select! {
                biased;
                _ = stop_requested(&mut shutdown) => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let delivery = tokio::select! {
                biased;
                _ = stop_requested(&mut shutdown) => break,
                delivery = consumer.next() => match delivery {
                    Some(delivery) => delivery,
                    None => {
                        tracing::info!(stage = stage_name, "Transport closed");
                        break;
                    }
                },
            };

            let worker = Worker {
                stage: self.stage.clone(),
                transport: self.transport.clone(),
                policy: self.policy,
                metrics: self.metrics.clone(),
            };
            in_flight.spawn(async move {
                worker.process(delivery).await;
                drop(permit);
            });

            while let Some(finished) = in_flight.try_join_next() {
                log_join(stage_name, finished);
            }
        }

        while let Some(finished) = in_flight.join_next().await {
            log_join(stage_name, finished);
        }
        drop(consumer);
        tracing::info!(stage = stage_name, "Stage stopped");
        Ok(())
    }
}

/// Resolves once shutdown is requested or the sender is gone.
async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

fn log_join(stage: &'static str, finished: Result<(), tokio::task::JoinError>) {
    if let Err(error) = finished {
        tracing::error!(stage, error = %error, "Stage task failed");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

struct Worker {
    stage: Arc<dyn Stage>,
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    metrics: Arc<StageMetrics>,
}

impl Worker {
    async fn process(&self, delivery: Delivery) {
        let stage = self.stage.name();
        let attempt = delivery.attempt;
        let result = self.handle(&delivery).await;
        let disposition = self.policy.decide(&result, attempt);

        let settled = match &disposition {
            Disposition::Ack { degraded } => {
                match degraded {
                    None => tracing::debug!(stage, attempt, "Delivery acknowledged"),
                    Some(reason) => tracing::warn!(
                        stage,
                        attempt,
                        reason = %reason,
                        "Delivery acknowledged with degraded result"
                    ),
                }
                self.transport.ack(&delivery.token).await
            }
            Disposition::Requeue { reason } => {
                tracing::warn!(
                    stage,
                    attempt,
                    max_attempts = self.policy.max_attempts(),
                    error = %reason,
                    "Transient failure; requeueing"
                );
                self.transport.nack(&delivery.token, true, reason).await
            }
            Disposition::DeadLetter { reason } => {
                tracing::error!(stage, attempt, error = %reason, "Dead-lettering delivery");
                self.transport.nack(&delivery.token, false, reason).await
            }
        };

        match settled {
            Ok(()) => match disposition {
                Disposition::Ack { degraded } => self.metrics.record_ack(degraded.is_some()),
                Disposition::Requeue { .. } => self.metrics.record_requeue(),
                Disposition::DeadLetter { .. } => self.metrics.record_dead_letter(),
            },
            Err(error) => {
                tracing::error!(stage, attempt, error = %error, "Failed to settle delivery")
            }
        }
    }

    /// Run the handler, turning a panic into a transient failure so the delivery is still
    /// settled under the retry bound.
    async fn handle(&self, delivery: &Delivery) -> Result<StageOutcome, StageError> {
        match AssertUnwindSafe(self.stage.handle(delivery))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(
                    stage = self.stage.name(),
                    attempt = delivery.attempt,
                    panic = message,
                    "Stage handler panicked"
                );
                Err(StageError::Transient(format!("handler panicked: {message}")))
            }
        }
    }
}

/// Collaborators shared by all stages.
#[derive(Clone)]
pub struct Collaborators {
    /// Blob store holding uploads and OCR text.
    pub store: Arc<dyn Store>,
    /// OCR engine.
    pub extractor: Arc<dyn TextExtractor>,
    /// Summary provider.
    pub summarizer: Arc<dyn Summarizer>,
    /// Search index.
    pub indexer: Arc<dyn Indexer>,
}

/// Tunables applied to every stage.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Handler invocations in flight per stage.
    pub concurrency: usize,
    /// Retry bound for transient failures.
    pub policy: RetryPolicy,
    /// Timeout for each collaborator call.
    pub call_timeout: Duration,
    /// Target index name.
    pub index_name: String,
}

impl From<&Config> for PipelineSettings {
    fn from(config: &Config) -> Self {
        Self {
            concurrency: config.concurrency,
            policy: RetryPolicy::new(config.max_attempts),
            call_timeout: config.call_timeout(),
            index_name: config.index_name.clone(),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// All three stages running against one transport.
pub struct Pipeline {
    shutdown: watch::Sender<bool>,
    runners: Vec<(&'static str, JoinHandle<Result<(), TransportError>>)>,
    metrics: BTreeMap<&'static str, Arc<StageMetrics>>,
}

impl Pipeline {
    /// Declare the queues and spawn one runner per stage.
    pub async fn start(
        transport: Arc<dyn Transport>,
        collaborators: Collaborators,
        settings: PipelineSettings,
    ) -> Result<Self, TransportError> {
        declare_topology(transport.as_ref()).await?;

        let stages: Vec<Arc<dyn Stage>> = vec![
            Arc::new(OcrStage::new(
                collaborators.store,
                collaborators.extractor,
                transport.clone(),
                settings.call_timeout,
            )),
            Arc::new(SummarizeStage::new(
                collaborators.summarizer,
                transport.clone(),
                settings.call_timeout,
            )),
            Arc::new(IndexStage::new(
                collaborators.indexer,
                settings.index_name.clone(),
                settings.call_timeout,
            )),
        ];

        let (shutdown, signal) = watch::channel(false);
        let mut runners = Vec::with_capacity(stages.len());
        let mut metrics = BTreeMap::new();
        for stage in stages {
            let name = stage.name();
            let runner = StageRunner::new(
                stage,
                transport.clone(),
                settings.policy,
                settings.concurrency,
            );
            metrics.insert(name, runner.metrics());
            runners.push((name, tokio::spawn(runner.run(signal.clone()))));
        }
        tracing::info!(
            stages = runners.len(),
            concurrency = settings.concurrency,
            max_attempts = settings.policy.max_attempts(),
            "Pipeline started"
        );

        Ok(Self {
            shutdown,
            runners,
            metrics,
        })
    }

    /// Per-stage counters so far. Deliveries still being settled may not be counted yet.
    pub fn metrics(&self) -> BTreeMap<&'static str, MetricsSnapshot> {
        self.metrics
            .iter()
            .map(|(name, metrics)| (*name, metrics.snapshot()))
            .collect()
    }

    /// Stop every runner after its in-flight handlers finish and return the final counters.
    pub async fn shutdown(self) -> BTreeMap<&'static str, MetricsSnapshot> {
        let _ = self.shutdown.send(true);
        for (name, handle) in self.runners {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    tracing::error!(stage = name, error = %error, "Stage exited with error")
                }
                Err(error) => tracing::error!(stage = name, error = %error, "Stage task failed"),
            }
        }
        tracing::info!("Pipeline stopped");
        self.metrics
            .iter()
            .map(|(name, metrics)| (*name, metrics.snapshot()))
            .collect()
    }
}
