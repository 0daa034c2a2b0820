use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;

use super::ResultCache;
use crate::error::CacheError;

// ---

/// Cache backed by the `result_cache` table (JSONB values).
#[derive(Clone)]
pub struct PgResultCache {
    pool: PgPool,
}

impl PgResultCache {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ResultCache for PgResultCache {
    async fn set(&self, key: &str, value: Value) -> Result<(), CacheError> {
        // ---
        sqlx::query(
            r#"
            INSERT INTO result_cache (key, value, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (key) DO UPDATE SET
                value = EXCLUDED.value,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        // ---
        let value = sqlx::query_scalar::<_, Value>("SELECT value FROM result_cache WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(value)
    }
}
