//! Read-side analytics computed straight from the reading store.
//!
//! The dashboard report ([`build_report`]) never touches the result cache;
//! the daily aggregate ([`daily_statistics`]) is what the worker caches.

use chrono::{DateTime, Local, NaiveDate, NaiveTime, TimeZone, Utc};
use futures::{future::try_join_all, TryStreamExt};
use serde::Serialize;

use crate::error::StoreError;
use crate::models::{DailyStatistic, SensorReading, SensorType};
use crate::store::{GroupKey, GroupSpec, ReadingFilter, ReadingStore};

// ---

/// Readings considered per sensor type in the per-type section.
const PER_TYPE_LIMIT: usize = 100;

/// Recent readings echoed back per sensor type.
const RECENT_LIMIT: usize = 5;

pub const DEFAULT_HOURS: u32 = 24;

/// Largest trend window accepted from a request, one hundred years.
pub const MAX_HOURS: u32 = 24 * 366 * 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalyticsQuery {
    pub field_id: Option<String>,
    /// Bounds the hourly-trend window only.
    pub hours: u32,
}

impl Default for AnalyticsQuery {
    fn default() -> Self {
        Self {
            field_id: None,
            hours: DEFAULT_HOURS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyticsReport {
    pub success: bool,
    pub summary: Summary,
    pub analytics: Vec<SensorTypeSummary>,
    #[serde(rename = "fieldStats")]
    pub field_stats: Vec<FieldStat>,
    #[serde(rename = "hourlyTrends")]
    pub hourly_trends: Vec<HourlyTrend>,
    #[serde(rename = "generatedAt")]
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub total_readings: u64,
    pub latest_reading: Option<DateTime<Utc>>,
    pub fields_count: usize,
    pub hours_analyzed: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorTypeSummary {
    pub sensor_type: SensorType,
    /// Mean of the newest readings, rounded to two decimals.
    pub average: f64,
    pub min: f64,
    pub max: f64,
    /// Unit of the newest reading.
    pub unit: String,
    pub count: usize,
    pub recent_readings: Vec<RecentReading>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecentReading {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub field_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct TrendKey {
    pub sensor_type: SensorType,
    pub hour: u32,
    pub field_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HourlyTrend {
    #[serde(rename = "_id")]
    pub id: TrendKey,
    pub average: f64,
    pub count: i64,
    pub latest: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldStat {
    #[serde(rename = "_id")]
    pub field_id: String,
    pub total_readings: i64,
    pub last_reading: DateTime<Utc>,
    pub sensor_types: Vec<SensorType>,
    pub avg_soil_moisture: Option<f64>,
    pub avg_temperature: Option<f64>,
}

/// Build the dashboard report as of `now`.
///
/// Fails as a whole on any store error; no partial report is returned.
pub async fn build_report(
    store: &dyn ReadingStore,
    query: &AnalyticsQuery,
    now: DateTime<Utc>,
) -> Result<AnalyticsReport, StoreError> {
    // ---
    let mut base = ReadingFilter::new();
    if let Some(field_id) = &query.field_id {
        base = base.field(field_id.clone());
    }

    let per_type = try_join_all(SensorType::ALL.iter().map(|&t| {
        let filter = base.clone().sensor_type(t);
        async move {
            let readings: Vec<SensorReading> =
                store.query(filter, PER_TYPE_LIMIT).try_collect().await?;
            Ok::<_, StoreError>(summarize_type(t, &readings))
        }
    }))
    .await?;
    let analytics: Vec<SensorTypeSummary> = per_type.into_iter().flatten().collect();

    // A window reaching past the representable range is left unbounded.
    let since = now.checked_sub_signed(chrono::Duration::hours(i64::from(query.hours)));
    let hourly_trends = hourly_trends(store, &base, since).await?;
    let field_stats = field_stats(store, &base).await?;

    let total_readings = store.count(&base).await?;
    let latest_reading = store.latest(&base).await?.map(|r| r.timestamp);

    tracing::debug!(
        total_readings,
        types = analytics.len(),
        fields = field_stats.len(),
        "built analytics report"
    );

    Ok(AnalyticsReport {
        success: true,
        summary: Summary {
            total_readings,
            latest_reading,
            fields_count: field_stats.len(),
            hours_analyzed: query.hours,
        },
        analytics,
        field_stats,
        hourly_trends,
        generated_at: now,
    })
}

/// Per-type section from the newest readings (newest first). `None` when
/// there are no readings of that type.
fn summarize_type(sensor_type: SensorType, readings: &[SensorReading]) -> Option<SensorTypeSummary> {
    // ---
    let newest = readings.first()?;
    let values = readings.iter().map(|r| r.reading_value);

    let sum: f64 = values.clone().sum();
    let min = values.clone().fold(f64::INFINITY, f64::min);
    let max = values.fold(f64::NEG_INFINITY, f64::max);

    Some(SensorTypeSummary {
        sensor_type,
        average: round2(sum / readings.len() as f64),
        min,
        max,
        unit: newest.unit.clone(),
        count: readings.len(),
        recent_readings: readings
            .iter()
            .take(RECENT_LIMIT)
            .map(|r| RecentReading {
                timestamp: r.timestamp,
                value: r.reading_value,
                field_id: r.field_id.clone(),
            })
            .collect(),
    })
}

async fn hourly_trends(
    store: &dyn ReadingStore,
    base: &ReadingFilter,
    since: Option<DateTime<Utc>>,
) -> Result<Vec<HourlyTrend>, StoreError> {
    // ---
    let mut spec = GroupSpec::by([GroupKey::SensorType, GroupKey::Hour, GroupKey::FieldId]);
    if let Some(since) = since {
        spec = spec.window_start(since);
    }

    let mut trends: Vec<HourlyTrend> = store
        .aggregate_grouped(base, &spec)
        .await?
        .into_iter()
        .filter_map(|g| {
            Some(HourlyTrend {
                id: TrendKey {
                    sensor_type: g.sensor_type?,
                    hour: g.hour?,
                    field_id: g.field_id?,
                },
                average: g.avg,
                count: g.count,
                latest: g.latest_timestamp,
            })
        })
        .collect();

    trends.sort_by(|a, b| {
        a.id.hour
            .cmp(&b.id.hour)
            .then_with(|| a.id.cmp(&b.id))
    });
    Ok(trends)
}

async fn field_stats(
    store: &dyn ReadingStore,
    base: &ReadingFilter,
) -> Result<Vec<FieldStat>, StoreError> {
    // ---
    let spec = GroupSpec::by([GroupKey::FieldId])
        .sub_averages([SensorType::SoilMoisture, SensorType::Temperature]);

    let mut stats: Vec<FieldStat> = store
        .aggregate_grouped(base, &spec)
        .await?
        .into_iter()
        .filter_map(|g| {
            let sub = |t: SensorType| g.sub_averages.get(&t).copied().flatten();
            Some(FieldStat {
                avg_soil_moisture: sub(SensorType::SoilMoisture),
                avg_temperature: sub(SensorType::Temperature),
                field_id: g.field_id?,
                total_readings: g.count,
                last_reading: g.latest_timestamp,
                sensor_types: g.sensor_types,
            })
        })
        .collect();

    stats.sort_by(|a, b| {
        b.total_readings
            .cmp(&a.total_readings)
            .then_with(|| a.field_id.cmp(&b.field_id))
    });
    Ok(stats)
}

/// Daily statistics per `(field_id, sensor_type)` for readings stamped at
/// or after `start`, scoped to `field_ids` unless it is empty. There is no
/// upper bound, so a reading stamped later today counts in every run.
///
/// Sorted by field then type, so equal inputs give identical output.
pub async fn daily_statistics(
    store: &dyn ReadingStore,
    field_ids: &[String],
    start: DateTime<Utc>,
) -> Result<Vec<DailyStatistic>, StoreError> {
    // ---
    let filter = ReadingFilter::new()
        .fields(field_ids.iter().cloned())
        .since(start);
    let spec = GroupSpec::by([GroupKey::FieldId, GroupKey::SensorType]);

    let mut stats: Vec<DailyStatistic> = store
        .aggregate_grouped(&filter, &spec)
        .await?
        .into_iter()
        .filter_map(|g| {
            Some(DailyStatistic {
                field_id: g.field_id?,
                sensor_type: g.sensor_type?,
                avg_value: g.avg,
                min_value: g.min,
                max_value: g.max,
                count: g.count,
            })
        })
        .collect();

    stats.sort_by(|a, b| {
        (a.field_id.as_str(), a.sensor_type).cmp(&(b.field_id.as_str(), b.sensor_type))
    });
    Ok(stats)
}

/// The server-local calendar day containing `now`, and the instant that
/// day started.
pub fn day_window(now: DateTime<Utc>) -> (NaiveDate, DateTime<Utc>) {
    // ---
    let date = now.with_timezone(&Local).date_naive();
    let midnight = date.and_time(NaiveTime::MIN);

    // Midnight can fall in a DST gap; the day then starts at the first
    // valid local instant, approximated by reading midnight as UTC.
    let start = Local
        .from_local_datetime(&midnight)
        .earliest()
        .map_or_else(|| midnight.and_utc(), |dt| dt.with_timezone(&Utc));

    (date, start.min(now))
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::store::InMemoryReadingStore;
    use chrono::Duration;

    fn reading(field: &str, t: SensorType, value: f64, ts: DateTime<Utc>) -> SensorReading {
        SensorReading {
            timestamp: ts,
            field_id: field.to_string(),
            sensor_type: t,
            reading_value: value,
            unit: match t {
                SensorType::Temperature => "C".to_string(),
                _ => "u".to_string(),
            },
        }
    }

    fn local_noon() -> DateTime<Utc> {
        Local
            .with_ymd_and_hms(2025, 6, 10, 12, 0, 0)
            .single()
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_round2() {
        assert_eq!(round2(20.456), 20.46);
        assert_eq!(round2(1.0 / 3.0), 0.33);
        assert_eq!(round2(-7.5), -7.5);
    }

    #[test]
    fn test_day_window_starts_at_local_midnight() {
        // ---
        let now = local_noon();
        let (date, start) = day_window(now);

        assert_eq!(date, NaiveDate::from_ymd_opt(2025, 6, 10).unwrap());
        assert_eq!(start.with_timezone(&Local).date_naive(), date);
        assert_eq!(now - start, Duration::hours(12));
    }

    #[tokio::test]
    async fn test_report_sections() {
        // ---
        let store = InMemoryReadingStore::new();
        let now = local_noon();
        let mut batch = Vec::new();
        for (i, v) in [10.0, 20.0, 30.0].iter().enumerate() {
            batch.push(reading("F1", SensorType::Temperature, *v, now - Duration::minutes(i as i64)));
        }
        batch.push(reading("F1", SensorType::SoilMoisture, 40.0, now - Duration::hours(1)));
        batch.push(reading("F2", SensorType::Temperature, 15.0, now - Duration::hours(2)));
        // Outside the default 24 h trend window.
        batch.push(reading("F2", SensorType::Ph, 6.5, now - Duration::hours(30)));
        store.replace_all(batch).await.unwrap();

        let report = build_report(&store, &AnalyticsQuery::default(), now)
            .await
            .unwrap();

        assert!(report.success);
        assert_eq!(report.summary.total_readings, 6);
        assert_eq!(report.summary.latest_reading, Some(now));
        assert_eq!(report.summary.fields_count, 2);
        assert_eq!(report.summary.hours_analyzed, 24);

        let types: Vec<SensorType> = report.analytics.iter().map(|a| a.sensor_type).collect();
        assert_eq!(
            types,
            vec![SensorType::SoilMoisture, SensorType::Temperature, SensorType::Ph]
        );
        let temp = &report.analytics[1];
        assert_eq!(temp.count, 4);
        assert_eq!(temp.average, 18.75);
        assert_eq!((temp.min, temp.max), (10.0, 30.0));
        assert_eq!(temp.unit, "C");
        assert_eq!(temp.recent_readings[0].value, 10.0);

        assert_eq!(report.field_stats[0].field_id, "F1");
        assert_eq!(report.field_stats[0].total_readings, 4);
        assert_eq!(report.field_stats[0].avg_temperature, Some(20.0));
        assert_eq!(report.field_stats[0].avg_soil_moisture, Some(40.0));
        assert_eq!(report.field_stats[1].avg_soil_moisture, None);

        let trend_count: i64 = report.hourly_trends.iter().map(|t| t.count).sum();
        assert_eq!(trend_count, 5);
        assert!(report
            .hourly_trends
            .windows(2)
            .all(|w| w[0].id.hour <= w[1].id.hour));
    }

    #[tokio::test]
    async fn test_report_scoped_to_field_and_empty_store() {
        // ---
        let store = InMemoryReadingStore::new();
        let now = local_noon();

        let empty = build_report(&store, &AnalyticsQuery::default(), now)
            .await
            .unwrap();
        assert_eq!(empty.summary.total_readings, 0);
        assert_eq!(empty.summary.latest_reading, None);
        assert!(empty.analytics.is_empty());
        assert!(empty.field_stats.is_empty());

        store
            .replace_all(vec![
                reading("F1", SensorType::Humidity, 55.0, now),
                reading("F2", SensorType::Humidity, 65.0, now),
            ])
            .await
            .unwrap();
        let query = AnalyticsQuery {
            field_id: Some("F2".into()),
            hours: 6,
        };
        let report = build_report(&store, &query, now).await.unwrap();

        assert_eq!(report.summary.total_readings, 1);
        assert_eq!(report.analytics[0].average, 65.0);
        assert_eq!(report.summary.hours_analyzed, 6);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["fieldStats"][0]["_id"], "F2");
        assert_eq!(json["fieldStats"][0]["avgTemperature"], serde_json::Value::Null);
        assert_eq!(json["hourlyTrends"][0]["_id"]["sensor_type"], "humidity");
        assert!(json["summary"]["totalReadings"].is_number());
    }

    #[tokio::test]
    async fn test_daily_statistics_scoped_and_sorted() {
        // ---
        let store = InMemoryReadingStore::new();
        let now = local_noon();
        let (_, start) = day_window(now);
        store
            .replace_all(vec![
                reading("F2", SensorType::Ph, 6.0, now),
                reading("F1", SensorType::Temperature, 10.0, now),
                reading("F1", SensorType::Humidity, 50.0, now),
                reading("F3", SensorType::Ph, 7.0, now),
                reading("F1", SensorType::Temperature, 99.0, start - Duration::minutes(1)),
            ])
            .await
            .unwrap();

        let stats = daily_statistics(&store, &["F1".to_string(), "F2".to_string()], start)
            .await
            .unwrap();

        let keys: Vec<(&str, SensorType)> = stats
            .iter()
            .map(|s| (s.field_id.as_str(), s.sensor_type))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("F1", SensorType::Temperature),
                ("F1", SensorType::Humidity),
                ("F2", SensorType::Ph),
            ]
        );
        assert_eq!(stats[0].avg_value, 10.0);

        let all = daily_statistics(&store, &[], start).await.unwrap();
        assert_eq!(all.len(), 4);
    }

    #[tokio::test]
    async fn test_daily_statistics_include_later_stamps() {
        // ---
        let store = InMemoryReadingStore::new();
        let now = local_noon();
        let (_, start) = day_window(now);
        store
            .replace_all(vec![
                reading("F1", SensorType::Temperature, 10.0, now - Duration::hours(1)),
                reading("F1", SensorType::Temperature, 30.0, now + Duration::hours(2)),
            ])
            .await
            .unwrap();

        let stats = daily_statistics(&store, &[], start).await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].count, 2);
        assert_eq!(stats[0].max_value, 30.0);
    }

    #[tokio::test]
    async fn test_report_with_huge_window_does_not_overflow() {
        // ---
        let store = InMemoryReadingStore::new();
        let now = local_noon();
        store
            .replace_all(vec![reading("F1", SensorType::Ph, 6.5, now - Duration::days(400))])
            .await
            .unwrap();

        let query = AnalyticsQuery {
            field_id: None,
            hours: u32::MAX,
        };
        let report = build_report(&store, &query, now).await.unwrap();
        assert_eq!(report.hourly_trends.len(), 1);
        assert_eq!(report.summary.hours_analyzed, u32::MAX);
    }
}
