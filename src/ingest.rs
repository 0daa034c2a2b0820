//! Batch ingestion: validate, replace the stored data set, queue aggregation.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};

use crate::error::IngestError;
use crate::models::{distinct_field_ids, parse_batch};
use crate::queue::{EnqueueOptions, JobHandle, JobKind, JobQueue};
use crate::store::ReadingStore;

// ---

/// Result of a successful upload.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestReport {
    /// Readings written to the store.
    pub count: usize,
    /// Distinct fields in the batch, first-seen order.
    pub field_ids: Vec<String>,
    /// The queued `aggregateDaily` job; `None` when enqueueing failed.
    pub job: Option<JobHandle>,
}

/// Owns the write side of the pipeline.
#[derive(Clone)]
pub struct Ingestor {
    store: Arc<dyn ReadingStore>,
    queue: Arc<dyn JobQueue>,
    options: EnqueueOptions,
}

impl Ingestor {
    pub fn new(
        store: Arc<dyn ReadingStore>,
        queue: Arc<dyn JobQueue>,
        options: EnqueueOptions,
    ) -> Self {
        Self {
            store,
            queue,
            options,
        }
    }

    /// Ingest one upload body.
    ///
    /// The whole batch is validated before the store is touched. Once the
    /// replace has committed, an `aggregateDaily` job for the batch's fields
    /// is enqueued on a best-effort basis: a queue failure is logged and
    /// reported as `job: None`, never as an error, and never undoes the
    /// write.
    pub async fn ingest(&self, body: &Value) -> Result<IngestReport, IngestError> {
        // ---
        let readings = parse_batch(body, Utc::now())?;
        let field_ids = distinct_field_ids(&readings);

        let count = self.store.replace_all(readings).await?;
        tracing::info!(count, fields = field_ids.len(), "stored sensor batch");

        let payload = json!({ "fieldIds": field_ids });
        let job = match self
            .queue
            .enqueue(JobKind::AggregateDaily, payload, &self.options)
            .await
        {
            Ok(handle) => {
                tracing::debug!(job_id = %handle.id, run_at = %handle.run_at, "queued aggregateDaily");
                Some(handle)
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to queue aggregateDaily; readings remain stored");
                None
            }
        };

        Ok(IngestReport {
            count,
            field_ids,
            job,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    // ---
    use super::*;
    use crate::error::{InvalidBatchError, QueueError};
    use crate::queue::{FailOutcome, InMemoryJobQueue, Job, QueueStats};
    use crate::store::{InMemoryReadingStore, ReadingFilter};
    use async_trait::async_trait;

    /// A queue whose every operation fails.
    pub(crate) struct UnavailableQueue;

    #[async_trait]
    impl JobQueue for UnavailableQueue {
        async fn enqueue(
            &self,
            _kind: JobKind,
            _payload: Value,
            _options: &EnqueueOptions,
        ) -> Result<JobHandle, QueueError> {
            Err(QueueError::Unavailable("connection refused".into()))
        }

        async fn claim(&self) -> Result<Option<Job>, QueueError> {
            Err(QueueError::Unavailable("connection refused".into()))
        }

        async fn ack(&self, _job: &Job) -> Result<(), QueueError> {
            Err(QueueError::Unavailable("connection refused".into()))
        }

        async fn fail(&self, _job: &Job, _error: &str) -> Result<FailOutcome, QueueError> {
            Err(QueueError::Unavailable("connection refused".into()))
        }

        async fn stats(&self) -> Result<QueueStats, QueueError> {
            Err(QueueError::Unavailable("connection refused".into()))
        }
    }

    fn setup() -> (Arc<InMemoryReadingStore>, Arc<InMemoryJobQueue>, Ingestor) {
        let store = Arc::new(InMemoryReadingStore::new());
        let queue = Arc::new(InMemoryJobQueue::default());
        let ingestor = Ingestor::new(store.clone(), queue.clone(), EnqueueOptions::default());
        (store, queue, ingestor)
    }

    #[tokio::test]
    async fn test_ingest_stores_then_enqueues() {
        // ---
        let (store, queue, ingestor) = setup();
        let body = json!([
            {"field_id": "F2", "sensor_type": "ph", "reading_value": 6.8, "unit": "pH"},
            {"field_id": "F1", "sensor_type": "temperature", "reading_value": 22.1, "unit": "C"},
            {"field_id": "F2", "sensor_type": "humidity", "reading_value": 40, "unit": "%"}
        ]);

        let report = ingestor.ingest(&body).await.unwrap();

        assert_eq!(report.count, 3);
        assert_eq!(report.field_ids, vec!["F2", "F1"]);
        assert_eq!(store.count(&ReadingFilter::new()).await.unwrap(), 3);

        let jobs = queue.snapshot();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].0.kind, JobKind::AggregateDaily);
        assert_eq!(jobs[0].0.payload, json!({"fieldIds": ["F2", "F1"]}));
        assert_eq!(report.job.map(|h| h.id), Some(jobs[0].0.id));
    }

    #[tokio::test]
    async fn test_invalid_batch_leaves_store_and_queue_alone() {
        // ---
        let (store, queue, ingestor) = setup();
        ingestor
            .ingest(&json!([{"field_id": "F1", "sensor_type": "ph", "reading_value": 7, "unit": "pH"}]))
            .await
            .unwrap();
        let before = store.snapshot();

        let bad = json!([
            {"field_id": "F9", "sensor_type": "ph", "reading_value": 7, "unit": "pH"},
            {"field_id": "F9", "sensor_type": "radiation", "reading_value": 1, "unit": "Sv"}
        ]);
        let err = ingestor.ingest(&bad).await.unwrap_err();

        assert!(matches!(
            err,
            IngestError::InvalidBatch(InvalidBatchError::InvalidReading { index: 1, .. })
        ));
        assert_eq!(store.snapshot(), before);
        assert_eq!(queue.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_failure_does_not_fail_ingest() {
        // ---
        let store = Arc::new(InMemoryReadingStore::new());
        let ingestor = Ingestor::new(
            store.clone(),
            Arc::new(UnavailableQueue),
            EnqueueOptions::default(),
        );

        let report = ingestor
            .ingest(&json!([{"field_id": "F1", "sensor_type": "rainfall", "reading_value": 2.5, "unit": "mm"}]))
            .await
            .unwrap();

        assert_eq!(report.count, 1);
        assert!(report.job.is_none());
        assert_eq!(store.snapshot().len(), 1);
    }
}
