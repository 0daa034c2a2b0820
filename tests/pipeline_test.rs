//! Ingest-to-cache flows on the in-memory backends.

use std::time::Duration;

use chrono::{Local, TimeZone, Utc};
use serde_json::{json, Value};
use tokio_test::{assert_err, assert_ok};

use fieldpulse::backends::Backends;
use fieldpulse::cache::ResultCache;
use fieldpulse::error::{IngestError, InvalidBatchError};
use fieldpulse::models::SensorType;
use fieldpulse::queue::{EnqueueOptions, JobKind, JobQueue, RetryPolicy};
use fieldpulse::store::{ReadingFilter, ReadingStore};
use fieldpulse::worker::{JobOutcome, WorkerOptions};

fn setup() -> Backends {
    Backends::in_memory(RetryPolicy::default())
}

fn immediate() -> EnqueueOptions {
    EnqueueOptions::default().immediate()
}

#[tokio::test]
async fn test_single_reading_is_stored_and_queued() {
    // ---
    let backends = setup();
    let state = backends.app_state(EnqueueOptions::default());

    let report = assert_ok!(
        state
            .ingestor
            .ingest(&json!([{
                "timestamp": "2025-03-26T18:45:00Z",
                "field_id": "F1",
                "sensor_type": "temperature",
                "reading_value": 22.4,
                "unit": "C"
            }]))
            .await
    );

    assert_eq!(report.count, 1);
    assert_eq!(report.field_ids, vec!["F1"]);
    assert_eq!(backends.store.count(&ReadingFilter::new()).await.unwrap(), 1);

    let stats = backends.queue.stats().await.unwrap();
    assert_eq!(stats.pending, 1);
    let handle = report.job.expect("aggregateDaily should be queued");
    assert_eq!(handle.kind, JobKind::AggregateDaily);
    // Debounced: nothing is claimable yet.
    assert!(backends.queue.claim().await.unwrap().is_none());
}

#[tokio::test]
async fn test_empty_batch_is_rejected() {
    // ---
    let backends = setup();
    let state = backends.app_state(immediate());

    let err = assert_err!(state.ingestor.ingest(&json!([])).await);

    assert!(matches!(err, IngestError::InvalidBatch(InvalidBatchError::Empty)));
    assert_eq!(err.to_string(), "No sensor readings provided");
    assert_eq!(backends.queue.stats().await.unwrap().pending, 0);
}

#[tokio::test]
async fn test_missing_unit_leaves_store_unchanged() {
    // ---
    let backends = setup();
    let state = backends.app_state(immediate());
    state
        .ingestor
        .ingest(&json!([{"field_id": "F0", "sensor_type": "ph", "reading_value": 6.9, "unit": "pH"}]))
        .await
        .unwrap();
    let job = backends.queue.claim().await.unwrap().unwrap();
    backends.queue.ack(&job).await.unwrap();

    let err = state
        .ingestor
        .ingest(&json!([{"field_id": "F1", "sensor_type": "temperature", "reading_value": 20}]))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        IngestError::InvalidBatch(InvalidBatchError::InvalidReading { index: 0, .. })
    ));
    let remaining: Vec<_> = futures::TryStreamExt::try_collect(
        backends.store.query(ReadingFilter::new(), 10),
    )
    .await
    .unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].field_id, "F0");
    assert_eq!(backends.queue.stats().await.unwrap().pending, 0);
}

#[tokio::test]
async fn test_worker_caches_daily_statistics() {
    // ---
    let backends = setup();
    let state = backends.app_state(immediate());
    let now = Local
        .with_ymd_and_hms(2025, 6, 10, 12, 0, 0)
        .single()
        .unwrap()
        .with_timezone(&Utc);

    let batch: Vec<Value> = [10.0, 20.0, 30.0]
        .iter()
        .enumerate()
        .map(|(i, v)| {
            json!({
                "timestamp": (now - chrono::Duration::minutes(i as i64 + 1)).to_rfc3339(),
                "field_id": "F1",
                "sensor_type": "temperature",
                "reading_value": v,
                "unit": "C"
            })
        })
        .collect();
    state.ingestor.ingest(&Value::Array(batch)).await.unwrap();

    let worker = backends.worker(WorkerOptions::default());
    assert_eq!(
        worker.run_once_at(now).await.unwrap(),
        Some(JobOutcome::Completed)
    );

    let date = now.with_timezone(&Local).date_naive();
    let stats = backends.cache.get_daily_stats(date).await.unwrap().unwrap();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].field_id, "F1");
    assert_eq!(stats[0].sensor_type, SensorType::Temperature);
    assert_eq!(stats[0].avg_value, 20.0);
    assert_eq!(stats[0].min_value, 10.0);
    assert_eq!(stats[0].max_value, 30.0);
    assert_eq!(stats[0].count, 3);

    let raw = backends
        .cache
        .get(&format!("daily_stats_{}", date.format("%Y-%m-%d")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        raw,
        json!([{"field_id": "F1", "sensor_type": "temperature",
                "avgValue": 20.0, "minValue": 10.0, "maxValue": 30.0, "count": 3}])
    );
}

#[tokio::test]
async fn test_cleanup_removes_expired_readings() {
    // ---
    let backends = setup();
    let state = backends.app_state(immediate());
    let now = Utc::now();
    let old = (now - chrono::Duration::days(31)).to_rfc3339();
    let recent = (now - chrono::Duration::days(1)).to_rfc3339();

    state
        .ingestor
        .ingest(&json!([
            {"timestamp": old, "field_id": "F1", "sensor_type": "rainfall", "reading_value": 4.0, "unit": "mm"},
            {"timestamp": recent, "field_id": "F1", "sensor_type": "rainfall", "reading_value": 1.0, "unit": "mm"}
        ]))
        .await
        .unwrap();

    let worker = backends.worker(WorkerOptions {
        cleanup_interval: Duration::from_secs(3600),
        ..WorkerOptions::default()
    });
    // Settle the aggregate queued by the upload first.
    assert_eq!(worker.run_once().await.unwrap(), Some(JobOutcome::Completed));

    worker.schedule_cleanup().await.unwrap();
    assert_eq!(worker.run_once().await.unwrap(), Some(JobOutcome::Completed));

    assert_eq!(backends.store.count(&ReadingFilter::new()).await.unwrap(), 1);
    let left = backends
        .store
        .latest(&ReadingFilter::new())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(left.reading_value, 1.0);
}
