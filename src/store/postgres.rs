use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{stream::BoxStream, StreamExt};
use sqlx::{postgres::PgRow, PgPool, Postgres, QueryBuilder, Row};

use super::{check_all, GroupKey, GroupSpec, GroupedStat, ReadingFilter, ReadingStore};
use crate::error::StoreError;
use crate::models::{SensorReading, SensorType};

// ---

/// Rows per INSERT statement; keeps bind parameters well under the
/// Postgres limit of 65535.
const INSERT_CHUNK: usize = 1000;

/// Nullable-parameter filter shared by the static read queries.
/// `$1` field ids, `$2` sensor type, `$3` since, `$4` until.
macro_rules! where_filter {
    () => {
        r#"
        WHERE ($1::TEXT[] IS NULL OR field_id = ANY($1))
          AND ($2::TEXT IS NULL OR sensor_type = $2)
          AND ($3::TIMESTAMPTZ IS NULL OR timestamp >= $3)
          AND ($4::TIMESTAMPTZ IS NULL OR timestamp <= $4)
        "#
    };
}

const QUERY_SQL: &str = concat!(
    "SELECT timestamp, field_id, sensor_type, reading_value, unit FROM sensor_readings",
    where_filter!(),
    "ORDER BY timestamp DESC, id DESC LIMIT $5"
);

const COUNT_SQL: &str = concat!("SELECT COUNT(*) FROM sensor_readings", where_filter!());

/// Reading store backed by the `sensor_readings` table.
#[derive(Clone)]
pub struct PgReadingStore {
    pool: PgPool,
}

impl PgReadingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct ReadingRow {
    timestamp: DateTime<Utc>,
    field_id: String,
    sensor_type: String,
    reading_value: f64,
    unit: String,
}

impl ReadingRow {
    fn into_reading(self) -> Result<SensorReading, StoreError> {
        // ---
        let sensor_type = self.sensor_type.parse().map_err(StoreError::CorruptRow)?;
        Ok(SensorReading {
            timestamp: self.timestamp,
            field_id: self.field_id,
            sensor_type,
            reading_value: self.reading_value,
            unit: self.unit,
        })
    }
}

#[async_trait]
impl ReadingStore for PgReadingStore {
    async fn replace_all(&self, readings: Vec<SensorReading>) -> Result<usize, StoreError> {
        // ---
        check_all(&readings)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM sensor_readings")
            .execute(&mut *tx)
            .await?;

        for chunk in readings.chunks(INSERT_CHUNK) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO sensor_readings (timestamp, field_id, sensor_type, reading_value, unit) ",
            );
            qb.push_values(chunk, |mut b, r| {
                b.push_bind(r.timestamp)
                    .push_bind(r.field_id.clone())
                    .push_bind(r.sensor_type.as_str())
                    .push_bind(r.reading_value)
                    .push_bind(r.unit.clone());
            });
            qb.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;

        tracing::debug!(count = readings.len(), "replaced sensor_readings contents");
        Ok(readings.len())
    }

    fn query(
        &self,
        filter: ReadingFilter,
        limit: usize,
    ) -> BoxStream<'_, Result<SensorReading, StoreError>> {
        // ---
        let field_ids = filter.scoped_fields().map(<[String]>::to_vec);

        sqlx::query_as::<_, ReadingRow>(QUERY_SQL)
            .bind(field_ids)
            .bind(filter.sensor_type.map(|t| t.as_str()))
            .bind(filter.since)
            .bind(filter.until)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch(&self.pool)
            .map(|row| row.map_err(StoreError::from).and_then(ReadingRow::into_reading))
            .boxed()
    }

    async fn aggregate_grouped(
        &self,
        filter: &ReadingFilter,
        spec: &GroupSpec,
    ) -> Result<Vec<GroupedStat>, StoreError> {
        // ---
        let filter = filter.with_window(spec.window_start);
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("SELECT ");

        let mut group_cols = Vec::new();
        for key in &spec.group_by {
            match key {
                GroupKey::FieldId => {
                    qb.push("field_id, ");
                    group_cols.push("field_id");
                }
                GroupKey::SensorType => {
                    qb.push("sensor_type, ");
                    group_cols.push("sensor_type");
                }
                GroupKey::Hour => {
                    qb.push("EXTRACT(HOUR FROM timestamp AT TIME ZONE 'UTC')::INT4 AS hour, ");
                    group_cols.push("hour");
                }
            }
        }

        qb.push(
            r#"AVG(reading_value)::FLOAT8 AS avg_value,
               MIN(reading_value) AS min_value,
               MAX(reading_value) AS max_value,
               COUNT(*) AS reading_count,
               MAX(timestamp) AS latest,
               array_agg(DISTINCT sensor_type) AS sensor_types"#,
        );

        for (i, t) in spec.sub_averages.iter().enumerate() {
            qb.push(", AVG(reading_value) FILTER (WHERE sensor_type = ")
                .push_bind(t.as_str())
                .push(format!(")::FLOAT8 AS sub_{i}"));
        }

        qb.push(" FROM sensor_readings");
        push_filter(&mut qb, &filter);

        if !group_cols.is_empty() {
            qb.push(" GROUP BY ").push(group_cols.join(", "));
        }

        let rows = qb.build().fetch_all(&self.pool).await?;

        let mut stats = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(stat) = map_group_row(row, spec)? {
                stats.push(stat);
            }
        }
        Ok(stats)
    }

    async fn count(&self, filter: &ReadingFilter) -> Result<u64, StoreError> {
        // ---
        let count: i64 = sqlx::query_scalar(COUNT_SQL)
            .bind(filter.scoped_fields().map(<[String]>::to_vec))
            .bind(filter.sensor_type.map(|t| t.as_str()))
            .bind(filter.since)
            .bind(filter.until)
            .fetch_one(&self.pool)
            .await?;

        Ok(count.max(0) as u64)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        // ---
        let result = sqlx::query("DELETE FROM sensor_readings WHERE timestamp < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

fn push_filter<'a>(qb: &mut QueryBuilder<'a, Postgres>, filter: &ReadingFilter) {
    // ---
    let mut has_where = false;
    let mut prefix = |qb: &mut QueryBuilder<'a, Postgres>| {
        if has_where {
            qb.push(" AND ");
        } else {
            qb.push(" WHERE ");
            has_where = true;
        }
    };

    if let Some(ids) = filter.scoped_fields() {
        prefix(qb);
        qb.push("field_id = ANY(").push_bind(ids.to_vec()).push(")");
    }

    if let Some(t) = filter.sensor_type {
        prefix(qb);
        qb.push("sensor_type = ").push_bind(t.as_str());
    }

    if let Some(since) = filter.since {
        prefix(qb);
        qb.push("timestamp >= ").push_bind(since);
    }

    if let Some(until) = filter.until {
        prefix(qb);
        qb.push("timestamp <= ").push_bind(until);
    }
}

fn map_group_row(row: &PgRow, spec: &GroupSpec) -> Result<Option<GroupedStat>, StoreError> {
    // ---
    let count: i64 = row.try_get("reading_count")?;
    // An ungrouped aggregate over zero rows still yields one row of NULLs.
    if count == 0 {
        return Ok(None);
    }

    let field_id = if spec.groups(GroupKey::FieldId) {
        Some(row.try_get::<String, _>("field_id")?)
    } else {
        None
    };
    let sensor_type = if spec.groups(GroupKey::SensorType) {
        Some(parse_type(&row.try_get::<String, _>("sensor_type")?)?)
    } else {
        None
    };
    let hour = if spec.groups(GroupKey::Hour) {
        let h: i32 = row.try_get("hour")?;
        Some(u32::try_from(h).map_err(|_| StoreError::CorruptRow(format!("hour {h}")))?)
    } else {
        None
    };

    let mut sensor_types = row
        .try_get::<Vec<String>, _>("sensor_types")?
        .iter()
        .map(|s| parse_type(s))
        .collect::<Result<Vec<_>, _>>()?;
    sensor_types.sort();

    let mut sub_averages = BTreeMap::new();
    for (i, t) in spec.sub_averages.iter().enumerate() {
        let avg: Option<f64> = row.try_get(format!("sub_{i}").as_str())?;
        sub_averages.insert(*t, avg);
    }

    Ok(Some(GroupedStat {
        field_id,
        sensor_type,
        hour,
        avg: row.try_get("avg_value")?,
        min: row.try_get("min_value")?,
        max: row.try_get("max_value")?,
        count,
        latest_timestamp: row.try_get("latest")?,
        sensor_types,
        sub_averages,
    }))
}

fn parse_type(s: &str) -> Result<SensorType, StoreError> {
    s.parse().map_err(StoreError::CorruptRow)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::{Duration, TimeZone};
    use futures::TryStreamExt;
    use sqlx::postgres::PgPoolOptions;

    /// Connects to `TEST_DATABASE_URL` when set; these tests are skipped
    /// otherwise.
    async fn test_store() -> Option<PgReadingStore> {
        // ---
        let url = match std::env::var("TEST_DATABASE_URL") {
            Ok(url) => url,
            Err(_) => {
                eprintln!("[fieldpulse-test] skipping: TEST_DATABASE_URL is not set");
                return None;
            }
        };
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(&url)
            .await
            .expect("failed to connect to TEST_DATABASE_URL");
        crate::schema::create_schema(&pool)
            .await
            .expect("failed to create schema");
        Some(PgReadingStore::new(pool))
    }

    fn reading(field: &str, t: SensorType, value: f64, ts: DateTime<Utc>) -> SensorReading {
        SensorReading {
            timestamp: ts,
            field_id: field.to_string(),
            sensor_type: t,
            reading_value: value,
            unit: "u".to_string(),
        }
    }

    #[test]
    fn test_static_queries_share_filter() {
        // ---
        assert!(QUERY_SQL.contains("field_id = ANY($1)"));
        assert!(QUERY_SQL.ends_with("LIMIT $5"));
        assert!(COUNT_SQL.contains("timestamp <= $4"));
    }

    // One test only: every step rewrites the shared table.
    #[tokio::test]
    async fn test_pg_replace_query_aggregate() {
        // ---
        let Some(store) = test_store().await else {
            return;
        };
        let base = Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap();

        let batch = vec![
            reading("F1", SensorType::Temperature, 10.0, base),
            reading("F1", SensorType::Temperature, 20.0, base + Duration::minutes(10)),
            reading("F1", SensorType::Temperature, 30.0, base + Duration::minutes(20)),
            reading("F2", SensorType::Ph, 6.5, base + Duration::hours(1)),
        ];
        assert_eq!(store.replace_all(batch).await.unwrap(), 4);

        let newest: Vec<_> = store
            .query(ReadingFilter::new().field("F1"), 1)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(newest[0].reading_value, 30.0);

        let spec = GroupSpec::by([GroupKey::FieldId, GroupKey::SensorType]);
        let stats = store
            .aggregate_grouped(&ReadingFilter::new().field("F1"), &spec)
            .await
            .unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].avg, 20.0);
        assert_eq!(stats[0].count, 3);

        let mut bad = reading("F3", SensorType::Ph, 7.0, base);
        bad.field_id.clear();
        assert!(store.replace_all(vec![bad]).await.is_err());
        assert_eq!(store.count(&ReadingFilter::new()).await.unwrap(), 4);

        let removed = store
            .delete_older_than(base + Duration::minutes(30))
            .await
            .unwrap();
        assert_eq!(removed, 3);
    }
}
