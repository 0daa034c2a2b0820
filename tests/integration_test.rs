//! End-to-end checks against a running `fieldpulse` server.
//!
//! Start the server (with its embedded worker) and run
//! `cargo test -- --ignored`; `BASE_URL` defaults to `http://localhost:8080`.
//! Each test replaces the server's stored readings.

use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};

fn base_url() -> String {
    std::env::var("BASE_URL").unwrap_or_else(|_| "http://localhost:8080".into())
}

#[derive(Debug, Deserialize)]
struct IngestResponse {
    success: bool,
    count: usize,
}

#[derive(Debug, Deserialize)]
struct StoredReading {
    timestamp: DateTime<Utc>,
    field_id: String,
    sensor_type: String,
    reading_value: f64,
    unit: String,
}

#[derive(Debug, Deserialize)]
struct ReadingsResponse {
    count: usize,
    data: Vec<StoredReading>,
}

#[tokio::test]
#[ignore = "needs a running server at BASE_URL"]
async fn ingest_then_query_readings() -> Result<()> {
    // ---
    let base = base_url();
    let client = Client::new();

    let batch = json!([
        {"timestamp": "2025-06-01T08:00:00Z", "field_id": "it-F1", "sensor_type": "temperature", "reading_value": 18.5, "unit": "C"},
        {"timestamp": "2025-06-01T09:00:00Z", "field_id": "it-F1", "sensor_type": "humidity", "reading_value": 61.0, "unit": "%"},
        {"timestamp": "2025-06-01T10:00:00Z", "field_id": "it-F2", "sensor_type": "ph", "reading_value": 6.7, "unit": "pH"}
    ]);
    let response = client.post(format!("{base}/ingest")).json(&batch).send().await?;
    assert_eq!(response.status(), StatusCode::CREATED);

    let body: IngestResponse = response.json().await?;
    assert!(body.success);
    assert_eq!(body.count, 3);

    let url = format!("{base}/readings?field_id=it-F1&limit=10");
    let readings: ReadingsResponse = client.get(&url).send().await?.json().await?;

    assert_eq!(readings.count, 2, "field filter failed for {url}");
    for r in &readings.data {
        assert_eq!(r.field_id, "it-F1");
        assert!(!r.unit.is_empty());
        assert!(r.reading_value.is_finite());
        assert!(["temperature", "humidity"].contains(&r.sensor_type.as_str()));
    }
    assert!(
        readings.data[0].timestamp >= readings.data[1].timestamp,
        "readings should be newest first"
    );

    Ok(())
}

#[tokio::test]
#[ignore = "needs a running server at BASE_URL"]
async fn invalid_batches_are_rejected() -> Result<()> {
    // ---
    let base = base_url();
    let client = Client::new();

    for (batch, message) in [
        (json!([]), "No sensor readings provided"),
        (json!({"field_id": "F1"}), "Request body must be an array"),
    ] {
        let response = client.post(format!("{base}/ingest")).json(&batch).send().await?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: Value = response.json().await?;
        assert_eq!(body["error"], message);
    }

    Ok(())
}

#[tokio::test]
#[ignore = "needs a running server at BASE_URL"]
async fn analytics_and_daily_cache_follow_ingest() -> Result<()> {
    // ---
    let base = base_url();
    let client = Client::new();

    let batch = json!([
        {"field_id": "it-F3", "sensor_type": "temperature", "reading_value": 10, "unit": "C"},
        {"field_id": "it-F3", "sensor_type": "temperature", "reading_value": 20, "unit": "C"},
        {"field_id": "it-F3", "sensor_type": "temperature", "reading_value": 30, "unit": "C"}
    ]);
    client.post(format!("{base}/ingest")).json(&batch).send().await?;

    let report: Value = client
        .get(format!("{base}/analytics?field_id=it-F3"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(report["success"], true);
    assert_eq!(report["summary"]["totalReadings"], 3);
    assert_eq!(report["analytics"][0]["average"], 20.0);

    // The worker picks the job up after the enqueue delay.
    let mut cached = None;
    for _ in 0..30 {
        let response = client.get(format!("{base}/analytics/daily")).send().await?;
        if response.status() == StatusCode::OK {
            let body: Value = response.json().await?;
            if body["data"][0]["count"] == 3 {
                cached = Some(body);
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    let cached = cached.expect("daily statistics were not cached in time");
    assert_eq!(cached["data"][0]["avgValue"], 20.0);
    assert_eq!(cached["data"][0]["minValue"], 10.0);
    assert_eq!(cached["data"][0]["maxValue"], 30.0);

    Ok(())
}
