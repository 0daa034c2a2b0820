use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use super::ResultCache;
use crate::error::CacheError;

// ---

#[derive(Default)]
pub struct InMemoryResultCache {
    entries: RwLock<HashMap<String, Value>>,
}

impl InMemoryResultCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultCache for InMemoryResultCache {
    async fn set(&self, key: &str, value: Value) -> Result<(), CacheError> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        Ok(self.entries.read().get(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::{DailyStatistic, SensorType};
    use chrono::NaiveDate;
    use serde_json::json;

    #[tokio::test]
    async fn test_last_writer_wins() {
        // ---
        let cache = InMemoryResultCache::new();
        cache.set("k", json!([1])).await.unwrap();
        cache.set("k", json!([2, 3])).await.unwrap();

        assert_eq!(cache.get("k").await.unwrap(), Some(json!([2, 3])));
        assert_eq!(cache.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_daily_stats_round_trip() {
        // ---
        let cache = InMemoryResultCache::new();
        let date = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
        let stats = vec![DailyStatistic {
            field_id: "F1".into(),
            sensor_type: SensorType::Rainfall,
            avg_value: 1.5,
            min_value: 0.0,
            max_value: 3.0,
            count: 2,
        }];

        cache.put_daily_stats(date, &stats).await.unwrap();

        assert_eq!(cache.get_daily_stats(date).await.unwrap(), Some(stats));
        assert!(cache.get("daily_stats_2025-06-01").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_daily_stats_rejects_foreign_value() {
        // ---
        let cache = InMemoryResultCache::new();
        let date = NaiveDate::from_ymd_opt(2025, 6, 2).unwrap();
        cache
            .set("daily_stats_2025-06-02", json!({"not": "an array"}))
            .await
            .unwrap();

        assert!(matches!(
            cache.get_daily_stats(date).await,
            Err(CacheError::Serialization(_))
        ));
    }
}
