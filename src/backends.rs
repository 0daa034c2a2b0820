//! Construction of the store, queue and cache for the configured backend.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use sqlx::{postgres::PgPoolOptions, PgPool};

use crate::cache::{InMemoryResultCache, PgResultCache, ResultCache};
use crate::config::{Config, StoreBackend};
use crate::ingest::Ingestor;
use crate::queue::{EnqueueOptions, InMemoryJobQueue, JobQueue, PgJobQueue, RetryPolicy};
use crate::schema;
use crate::store::{InMemoryReadingStore, PgReadingStore, ReadingStore};
use crate::worker::{Worker, WorkerOptions};
use crate::AppState;

// ---

/// The three shared components, behind their traits.
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn ReadingStore>,
    pub queue: Arc<dyn JobQueue>,
    pub cache: Arc<dyn ResultCache>,
}

impl Backends {
    pub fn in_memory(policy: RetryPolicy) -> Self {
        Self {
            store: Arc::new(InMemoryReadingStore::new()),
            queue: Arc::new(InMemoryJobQueue::new(policy)),
            cache: Arc::new(InMemoryResultCache::new()),
        }
    }

    pub fn postgres(pool: PgPool, policy: RetryPolicy) -> Self {
        Self {
            store: Arc::new(PgReadingStore::new(pool.clone())),
            queue: Arc::new(PgJobQueue::new(pool.clone(), policy)),
            cache: Arc::new(PgResultCache::new(pool)),
        }
    }

    /// Build the configured backend. For Postgres this connects the pool
    /// and creates the schema.
    pub async fn connect(cfg: &Config) -> Result<Self> {
        // ---
        let policy = cfg.queue.retry_policy();
        let db_url = match cfg.store_backend {
            StoreBackend::Memory => {
                tracing::info!("Using in-memory backends; data is lost on exit");
                return Ok(Self::in_memory(policy));
            }
            StoreBackend::Postgres => cfg
                .db_url
                .as_deref()
                .ok_or_else(|| anyhow!("DATABASE_URL is required for the postgres backend"))?,
        };

        let masked = crate::config::mask_db_url(db_url);
        tracing::info!("Attempting to connect to database: {}", masked);

        let pool = PgPoolOptions::new()
            .max_connections(cfg.db_pool_max)
            .connect(db_url)
            .await
            .map_err(|e| anyhow!("Failed to connect to database '{}': {}", masked, e))?;

        tracing::info!("Successfully connected to database");

        schema::create_schema(&pool).await?;
        Ok(Self::postgres(pool, policy))
    }

    pub fn app_state(&self, options: EnqueueOptions) -> AppState {
        AppState {
            store: Arc::clone(&self.store),
            queue: Arc::clone(&self.queue),
            cache: Arc::clone(&self.cache),
            ingestor: Ingestor::new(Arc::clone(&self.store), Arc::clone(&self.queue), options),
        }
    }

    pub fn worker(&self, options: WorkerOptions) -> Worker {
        Worker::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.store),
            Arc::clone(&self.cache),
            options,
        )
    }
}
