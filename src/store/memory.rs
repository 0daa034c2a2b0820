use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use futures::{stream::BoxStream, StreamExt};
use parking_lot::RwLock;

use super::{check_all, GroupKey, GroupSpec, GroupedStat, ReadingFilter, ReadingStore};
use crate::error::StoreError;
use crate::models::{SensorReading, SensorType};

// ---

/// Process-local reading store. Used by `STORE_BACKEND=memory` and tests.
#[derive(Default)]
pub struct InMemoryReadingStore {
    readings: RwLock<Vec<SensorReading>>,
}

impl InMemoryReadingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current contents in insertion order.
    pub fn snapshot(&self) -> Vec<SensorReading> {
        self.readings.read().clone()
    }
}

type GroupId = (Option<String>, Option<SensorType>, Option<u32>);

#[derive(Default)]
struct Accumulator {
    sum: f64,
    min: f64,
    max: f64,
    count: i64,
    latest: Option<DateTime<Utc>>,
    types: BTreeSet<SensorType>,
    sub_sums: BTreeMap<SensorType, (f64, i64)>,
}

impl Accumulator {
    fn add(&mut self, r: &SensorReading, sub_types: &[SensorType]) {
        // ---
        if self.count == 0 {
            self.min = r.reading_value;
            self.max = r.reading_value;
        } else {
            self.min = self.min.min(r.reading_value);
            self.max = self.max.max(r.reading_value);
        }
        self.sum += r.reading_value;
        self.count += 1;
        self.latest = Some(self.latest.map_or(r.timestamp, |ts| ts.max(r.timestamp)));
        self.types.insert(r.sensor_type);
        if sub_types.contains(&r.sensor_type) {
            let entry = self.sub_sums.entry(r.sensor_type).or_insert((0.0, 0));
            entry.0 += r.reading_value;
            entry.1 += 1;
        }
    }

    fn finish(self, id: GroupId, sub_types: &[SensorType]) -> Option<GroupedStat> {
        // ---
        let latest_timestamp = self.latest?;
        let sub_averages = sub_types
            .iter()
            .map(|t| {
                let avg = self.sub_sums.get(t).map(|(sum, n)| sum / *n as f64);
                (*t, avg)
            })
            .collect();

        Some(GroupedStat {
            field_id: id.0,
            sensor_type: id.1,
            hour: id.2,
            avg: self.sum / self.count as f64,
            min: self.min,
            max: self.max,
            count: self.count,
            latest_timestamp,
            sensor_types: self.types.into_iter().collect(),
            sub_averages,
        })
    }
}

#[async_trait]
impl ReadingStore for InMemoryReadingStore {
    async fn replace_all(&self, readings: Vec<SensorReading>) -> Result<usize, StoreError> {
        // ---
        check_all(&readings)?;
        let count = readings.len();
        *self.readings.write() = readings;
        Ok(count)
    }

    fn query(
        &self,
        filter: ReadingFilter,
        limit: usize,
    ) -> BoxStream<'_, Result<SensorReading, StoreError>> {
        // ---
        let mut matched: Vec<SensorReading> = self
            .readings
            .read()
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();

        // Ties resolve newest-inserted first, like `ORDER BY timestamp, id DESC`.
        matched.reverse();
        matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        matched.truncate(limit);

        futures::stream::iter(matched.into_iter().map(Ok)).boxed()
    }

    async fn aggregate_grouped(
        &self,
        filter: &ReadingFilter,
        spec: &GroupSpec,
    ) -> Result<Vec<GroupedStat>, StoreError> {
        // ---
        let filter = filter.with_window(spec.window_start);
        let mut groups: BTreeMap<GroupId, Accumulator> = BTreeMap::new();

        for r in self.readings.read().iter().filter(|r| filter.matches(r)) {
            let id = (
                spec.groups(GroupKey::FieldId).then(|| r.field_id.clone()),
                spec.groups(GroupKey::SensorType).then_some(r.sensor_type),
                spec.groups(GroupKey::Hour).then(|| r.timestamp.hour()),
            );
            groups
                .entry(id)
                .or_default()
                .add(r, &spec.sub_averages);
        }

        Ok(groups
            .into_iter()
            .filter_map(|(id, acc)| acc.finish(id, &spec.sub_averages))
            .collect())
    }

    async fn count(&self, filter: &ReadingFilter) -> Result<u64, StoreError> {
        Ok(self.readings.read().iter().filter(|r| filter.matches(r)).count() as u64)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        // ---
        let mut readings = self.readings.write();
        let before = readings.len();
        readings.retain(|r| r.timestamp >= cutoff);
        Ok((before - readings.len()) as u64)
    }
}
