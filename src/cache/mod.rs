//! Result cache: last-writer-wins key-value store for precomputed aggregates.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;

use crate::error::CacheError;
use crate::models::DailyStatistic;

mod memory;
mod postgres;

pub use memory::InMemoryResultCache;
pub use postgres::PgResultCache;

// ---

/// Cache key for the daily aggregate of `date`, e.g. `daily_stats_2025-03-26`.
pub fn daily_stats_key(date: NaiveDate) -> String {
    format!("daily_stats_{}", date.format("%Y-%m-%d"))
}

#[async_trait]
pub trait ResultCache: Send + Sync {
    /// Overwrite `key` with `value`.
    async fn set(&self, key: &str, value: Value) -> Result<(), CacheError>;

    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError>;

    async fn put_daily_stats(
        &self,
        date: NaiveDate,
        stats: &[DailyStatistic],
    ) -> Result<(), CacheError> {
        // ---
        let value = serde_json::to_value(stats)?;
        self.set(&daily_stats_key(date), value).await
    }

    async fn get_daily_stats(
        &self,
        date: NaiveDate,
    ) -> Result<Option<Vec<DailyStatistic>>, CacheError> {
        // ---
        match self.get(&daily_stats_key(date)).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }
}
