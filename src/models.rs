//! Data models for the field telemetry pipeline.
//!
//! Uploaded readings arrive as loosely-typed JSON. [`parse_batch`] turns a
//! whole upload into typed [`SensorReading`]s or rejects it outright, so no
//! partially-valid batch ever reaches the store.

use std::{collections::HashSet, fmt, str::FromStr};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::InvalidBatchError;

// ---

/// The fixed set of sensor kinds a field station can report.
///
/// Declaration order is the canonical order used when reports enumerate
/// every type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorType {
    SoilMoisture,
    Temperature,
    Humidity,
    Ph,
    Sunlight,
    Rainfall,
    WindSpeed,
    SoilNitrogen,
}

impl SensorType {
    pub const ALL: [SensorType; 8] = [
        SensorType::SoilMoisture,
        SensorType::Temperature,
        SensorType::Humidity,
        SensorType::Ph,
        SensorType::Sunlight,
        SensorType::Rainfall,
        SensorType::WindSpeed,
        SensorType::SoilNitrogen,
    ];

    pub fn as_str(&self) -> &'static str {
        // ---
        match self {
            SensorType::SoilMoisture => "soil_moisture",
            SensorType::Temperature => "temperature",
            SensorType::Humidity => "humidity",
            SensorType::Ph => "ph",
            SensorType::Sunlight => "sunlight",
            SensorType::Rainfall => "rainfall",
            SensorType::WindSpeed => "wind_speed",
            SensorType::SoilNitrogen => "soil_nitrogen",
        }
    }
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SensorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // ---
        SensorType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown sensor_type '{s}'"))
    }
}

/// One stored observation. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    // ---
    pub timestamp: DateTime<Utc>,
    pub field_id: String,
    pub sensor_type: SensorType,
    pub reading_value: f64,
    pub unit: String,
}

impl SensorReading {
    /// Checks the invariants the type system cannot express.
    pub fn check(&self) -> Result<(), String> {
        // ---
        if self.field_id.is_empty() {
            return Err("field_id must not be empty".to_string());
        }
        if self.unit.is_empty() {
            return Err("unit must not be empty".to_string());
        }
        if !self.reading_value.is_finite() {
            return Err("reading_value must be a finite number".to_string());
        }
        Ok(())
    }
}

/// Per-field, per-type aggregate cached by the daily job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyStatistic {
    // ---
    pub field_id: String,
    pub sensor_type: SensorType,
    #[serde(rename = "avgValue")]
    pub avg_value: f64,
    #[serde(rename = "minValue")]
    pub min_value: f64,
    #[serde(rename = "maxValue")]
    pub max_value: f64,
    pub count: i64,
}

/// Payload of an `aggregateDaily` job. An empty list means "all fields".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateDailyPayload {
    #[serde(rename = "fieldIds", default)]
    pub field_ids: Vec<String>,
}

// ---

/// Validate a whole upload body.
///
/// The body must be a non-empty JSON array and every element must parse;
/// the first bad element rejects the batch. Readings without a timestamp
/// are stamped with `now`.
pub fn parse_batch(body: &Value, now: DateTime<Utc>) -> Result<Vec<SensorReading>, InvalidBatchError> {
    // ---
    let items = body.as_array().ok_or(InvalidBatchError::NotAnArray)?;
    if items.is_empty() {
        return Err(InvalidBatchError::Empty);
    }

    items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            parse_reading(item, now)
                .map_err(|reason| InvalidBatchError::InvalidReading { index, reason })
        })
        .collect()
}

fn parse_reading(item: &Value, now: DateTime<Utc>) -> Result<SensorReading, String> {
    // ---
    let obj = item
        .as_object()
        .ok_or_else(|| "reading must be an object".to_string())?;

    let field_id = required_str(obj, "field_id")?;
    let sensor_type: SensorType = required_str(obj, "sensor_type")?.parse()?;
    let reading_value = match obj.get("reading_value") {
        Some(Value::Number(n)) => n
            .as_f64()
            .ok_or_else(|| "reading_value is out of range".to_string())?,
        Some(_) => return Err("reading_value must be a number".to_string()),
        None => return Err("missing reading_value".to_string()),
    };
    let unit = required_str(obj, "unit")?;
    let timestamp = parse_timestamp(obj.get("timestamp"), now)?;

    let reading = SensorReading {
        timestamp,
        field_id: field_id.to_string(),
        sensor_type,
        reading_value,
        unit: unit.to_string(),
    };
    reading.check()?;
    Ok(reading)
}

fn required_str<'a>(obj: &'a serde_json::Map<String, Value>, key: &str) -> Result<&'a str, String> {
    // ---
    match obj.get(key) {
        Some(Value::String(s)) => Ok(s.as_str()),
        Some(_) => Err(format!("{key} must be a string")),
        None => Err(format!("missing {key}")),
    }
}

/// Accepts RFC 3339 strings or epoch milliseconds; absent or null means `now`.
fn parse_timestamp(value: Option<&Value>, now: DateTime<Utc>) -> Result<DateTime<Utc>, String> {
    // ---
    match value {
        None | Some(Value::Null) => Ok(now),
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|e| format!("timestamp '{s}' is not RFC 3339: {e}")),
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .ok_or_else(|| format!("timestamp {n} is not valid epoch milliseconds")),
        Some(_) => Err("timestamp must be a string or a number".to_string()),
    }
}

/// Distinct field ids in first-seen order.
pub fn distinct_field_ids(readings: &[SensorReading]) -> Vec<String> {
    // ---
    let mut seen = HashSet::new();
    readings
        .iter()
        .filter(|r| seen.insert(r.field_id.as_str()))
        .map(|r| r.field_id.clone())
        .collect()
}
