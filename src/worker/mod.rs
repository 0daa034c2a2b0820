//! Aggregation worker: claims jobs, dispatches them by kind, settles them.
//!
//! A worker is a long-lived loop. Any number of them may share one queue;
//! the queue's atomic claim keeps them from processing the same job. A job
//! that errors (or panics) goes back through [`JobQueue::fail`], so the
//! loop itself only stops on cancellation.

use std::{collections::HashMap, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::cache::ResultCache;
use crate::error::{JobProcessingError, QueueError};
use crate::queue::{EnqueueOptions, FailOutcome, Job, JobHandle, JobKind, JobQueue};
use crate::store::ReadingStore;

mod handlers;

pub use handlers::{AggregateDaily, CleanOldData};

// ---

/// Worker loop tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerOptions {
    /// Sleep between polls when nothing is due.
    pub poll_interval: Duration,
    /// Readings older than this are removed by `cleanOldData`.
    pub retention: chrono::Duration,
    /// How often this worker enqueues a `cleanOldData` job.
    pub cleanup_interval: Duration,
    pub cleanup_options: EnqueueOptions,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            retention: chrono::Duration::days(30),
            cleanup_interval: Duration::from_secs(86_400),
            cleanup_options: EnqueueOptions::default().immediate(),
        }
    }
}

/// Everything a handler may touch while processing one job.
#[derive(Clone)]
pub struct JobContext {
    pub store: Arc<dyn ReadingStore>,
    pub cache: Arc<dyn ResultCache>,
    /// Instant the job is processed at; day windows derive from it.
    pub now: DateTime<Utc>,
    pub retention: chrono::Duration,
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job, ctx: &JobContext) -> Result<(), JobProcessingError>;
}

/// Explicit kind to handler mapping.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `aggregateDaily` and `cleanOldData`.
    pub fn with_defaults() -> Self {
        Self::new()
            .register(JobKind::AggregateDaily, AggregateDaily)
            .register(JobKind::CleanOldData, CleanOldData)
    }

    pub fn register<H: JobHandler + 'static>(mut self, kind: JobKind, handler: H) -> Self {
        self.handlers.insert(kind, Arc::new(handler));
        self
    }

    pub fn get(&self, kind: &JobKind) -> Option<&Arc<dyn JobHandler>> {
        self.handlers.get(kind)
    }
}

/// How a claimed job was settled.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed,
    /// No handler for the kind; acknowledged without side effects.
    Skipped,
    Retrying {
        attempt: u32,
        retry_at: DateTime<Utc>,
    },
    DeadLettered {
        attempts: u32,
    },
}

impl From<FailOutcome> for JobOutcome {
    fn from(outcome: FailOutcome) -> Self {
        match outcome {
            FailOutcome::Retrying { attempt, retry_at } => JobOutcome::Retrying { attempt, retry_at },
            FailOutcome::DeadLettered { attempts } => JobOutcome::DeadLettered { attempts },
        }
    }
}

pub struct Worker {
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn ReadingStore>,
    cache: Arc<dyn ResultCache>,
    registry: HandlerRegistry,
    options: WorkerOptions,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn ReadingStore>,
        cache: Arc<dyn ResultCache>,
        options: WorkerOptions,
    ) -> Self {
        Self {
            queue,
            store,
            cache,
            registry: HandlerRegistry::with_defaults(),
            options,
        }
    }

    pub fn with_registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Claim and settle at most one job. `Ok(None)` when nothing was due.
    pub async fn run_once(&self) -> Result<Option<JobOutcome>, QueueError> {
        self.run_once_at(Utc::now()).await
    }

    /// [`Worker::run_once`] with the processing instant pinned to `now`.
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> Result<Option<JobOutcome>, QueueError> {
        // ---
        let Some(job) = self.queue.claim().await? else {
            return Ok(None);
        };

        let span = tracing::info_span!("job", job_id = %job.id, kind = %job.kind, attempt = job.attempts + 1);
        self.process(job, now).instrument(span).await.map(Some)
    }

    async fn process(&self, job: Job, now: DateTime<Utc>) -> Result<JobOutcome, QueueError> {
        // ---
        let Some(handler) = self.registry.get(&job.kind) else {
            tracing::warn!("no handler for job kind; acknowledging without processing");
            self.queue.ack(&job).await?;
            return Ok(JobOutcome::Skipped);
        };

        let ctx = JobContext {
            store: Arc::clone(&self.store),
            cache: Arc::clone(&self.cache),
            now,
            retention: self.options.retention,
        };

        let result = match AssertUnwindSafe(handler.handle(&job, &ctx)).catch_unwind().await {
            Ok(handled) => handled.map_err(|e| e.to_string()),
            Err(panic) => Err(panic_message(panic.as_ref())),
        };

        let error = match result {
            Ok(()) => {
                self.queue.ack(&job).await?;
                tracing::debug!("job completed");
                return Ok(JobOutcome::Completed);
            }
            Err(e) => e,
        };

        let outcome = self.queue.fail(&job, &error).await?;
        match &outcome {
            FailOutcome::Retrying { attempt, retry_at } => {
                tracing::warn!(%error, attempt, %retry_at, "job failed; retry scheduled");
            }
            FailOutcome::DeadLettered { attempts } => {
                tracing::error!(%error, attempts, "job failed permanently; dead-lettered");
            }
        }
        Ok(outcome.into())
    }

    /// Enqueue a `cleanOldData` job with the configured options.
    pub async fn schedule_cleanup(&self) -> Result<JobHandle, QueueError> {
        // ---
        self.queue
            .enqueue(JobKind::CleanOldData, Value::Null, &self.options.cleanup_options)
            .await
    }

    /// Poll until `shutdown` fires. The job in progress when cancellation
    /// arrives is finished first.
    pub async fn run(self, shutdown: CancellationToken) {
        // ---
        tracing::info!(
            poll_ms = self.options.poll_interval.as_millis() as u64,
            cleanup_secs = self.options.cleanup_interval.as_secs(),
            "worker started"
        );
        let mut next_cleanup = Instant::now() + self.options.cleanup_interval;

        while !shutdown.is_cancelled() {
            if Instant::now() >= next_cleanup {
                match self.schedule_cleanup().await {
                    Ok(handle) => tracing::info!(job_id = %handle.id, "scheduled cleanOldData"),
                    Err(e) => tracing::error!(error = %e, "failed to schedule cleanOldData"),
                }
                next_cleanup = Instant::now() + self.options.cleanup_interval;
            }

            match self.run_once().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => tracing::error!(error = %e, "queue error while processing jobs"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.options.poll_interval) => {}
            }
        }

        tracing::info!("worker stopped");
    }
}

/// Handler errors and panics both end up as the job's failure text.
fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    // ---
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("handler panicked: {detail}")
}
