//! Reading store: the durable collection of sensor readings.
//!
//! The store models a single "latest upload": [`ReadingStore::replace_all`]
//! discards everything before inserting a new batch. Two concurrent uploads
//! race and the last commit wins; that is a known property of the current
//! snapshot semantics, not something the store tries to arbitrate.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{stream::BoxStream, TryStreamExt};

use crate::error::StoreError;
use crate::models::{SensorReading, SensorType};

mod memory;
mod postgres;

pub use memory::InMemoryReadingStore;
pub use postgres::PgReadingStore;

// ---

/// Row filter shared by every read operation. `None` fields match all rows;
/// an empty `field_ids` list is treated the same as `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadingFilter {
    pub field_ids: Option<Vec<String>>,
    pub sensor_type: Option<SensorType>,
    /// Inclusive lower bound.
    pub since: Option<DateTime<Utc>>,
    /// Inclusive upper bound.
    pub until: Option<DateTime<Utc>>,
}

impl ReadingFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field<S: Into<String>>(mut self, field_id: S) -> Self {
        self.field_ids = Some(vec![field_id.into()]);
        self
    }

    pub fn fields<I, S>(mut self, field_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.field_ids = Some(field_ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn sensor_type(mut self, sensor_type: SensorType) -> Self {
        self.sensor_type = Some(sensor_type);
        self
    }

    pub fn since(mut self, ts: DateTime<Utc>) -> Self {
        self.since = Some(ts);
        self
    }

    pub fn until(mut self, ts: DateTime<Utc>) -> Self {
        self.until = Some(ts);
        self
    }

    /// Field ids to restrict on, if any.
    pub fn scoped_fields(&self) -> Option<&[String]> {
        self.field_ids.as_deref().filter(|ids| !ids.is_empty())
    }

    pub fn matches(&self, reading: &SensorReading) -> bool {
        // ---
        if let Some(ids) = self.scoped_fields() {
            if !ids.iter().any(|id| id == &reading.field_id) {
                return false;
            }
        }
        if let Some(t) = self.sensor_type {
            if reading.sensor_type != t {
                return false;
            }
        }
        if let Some(since) = self.since {
            if reading.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if reading.timestamp > until {
                return false;
            }
        }
        true
    }

    /// Narrow the lower bound to `window_start` when it is later.
    fn with_window(&self, window_start: Option<DateTime<Utc>>) -> Self {
        // ---
        let mut filter = self.clone();
        filter.since = match (self.since, window_start) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        filter
    }
}

/// Dimensions a grouped aggregation can partition by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GroupKey {
    FieldId,
    SensorType,
    /// UTC hour of day (0-23) extracted from the reading timestamp.
    Hour,
}

/// Shape of a grouped aggregation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupSpec {
    pub group_by: Vec<GroupKey>,
    pub window_start: Option<DateTime<Utc>>,
    /// Sensor types to compute a conditional average for within each group.
    pub sub_averages: Vec<SensorType>,
}

impl GroupSpec {
    pub fn by<I: IntoIterator<Item = GroupKey>>(keys: I) -> Self {
        Self {
            group_by: keys.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn window_start(mut self, ts: DateTime<Utc>) -> Self {
        self.window_start = Some(ts);
        self
    }

    pub fn sub_averages<I: IntoIterator<Item = SensorType>>(mut self, types: I) -> Self {
        self.sub_averages = types.into_iter().collect();
        self
    }

    fn groups(&self, key: GroupKey) -> bool {
        self.group_by.contains(&key)
    }
}

/// One group of a grouped aggregation. Key fields outside `group_by` are
/// `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupedStat {
    // ---
    pub field_id: Option<String>,
    pub sensor_type: Option<SensorType>,
    pub hour: Option<u32>,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub count: i64,
    pub latest_timestamp: DateTime<Utc>,
    /// Distinct sensor types present in the group, sorted.
    pub sensor_types: Vec<SensorType>,
    /// Conditional averages requested through [`GroupSpec::sub_averages`].
    /// `None` when the group holds no reading of that type.
    pub sub_averages: BTreeMap<SensorType, Option<f64>>,
}

// ---

#[async_trait]
pub trait ReadingStore: Send + Sync {
    /// Atomically replace the whole collection with `readings`.
    ///
    /// Every reading is checked before anything is deleted; a failing
    /// reading leaves the store untouched. Returns the number inserted.
    async fn replace_all(&self, readings: Vec<SensorReading>) -> Result<usize, StoreError>;

    /// Matching readings, newest first, at most `limit` of them.
    ///
    /// The stream can be consumed once. The Postgres backend fetches rows
    /// as it is polled; the in-memory backend collects the matches up front.
    fn query(
        &self,
        filter: ReadingFilter,
        limit: usize,
    ) -> BoxStream<'_, Result<SensorReading, StoreError>>;

    async fn aggregate_grouped(
        &self,
        filter: &ReadingFilter,
        spec: &GroupSpec,
    ) -> Result<Vec<GroupedStat>, StoreError>;

    async fn count(&self, filter: &ReadingFilter) -> Result<u64, StoreError>;

    /// Delete readings strictly older than `cutoff`. Returns rows removed.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Newest matching reading.
    async fn latest(&self, filter: &ReadingFilter) -> Result<Option<SensorReading>, StoreError> {
        // ---
        let mut stream = self.query(filter.clone(), 1);
        stream.try_next().await
    }
}

/// Shared pre-write check so both backends reject the same batches.
fn check_all(readings: &[SensorReading]) -> Result<(), StoreError> {
    // ---
    readings
        .iter()
        .enumerate()
        .try_for_each(|(i, r)| {
            r.check()
                .map_err(|reason| StoreError::Validation(format!("reading {i}: {reason}")))
        })
}
