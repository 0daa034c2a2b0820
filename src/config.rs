//! Configuration loader for the `fieldpulse` service and worker.
//!
//! All runtime settings and their defaults live here, loaded from
//! environment variables (with optional `.env` support provided by the
//! caller). Nothing else in the crate reads the environment for settings.

use std::{env, net::SocketAddr, time::Duration};

use anyhow::{anyhow, bail, Result};

use crate::queue::{EnqueueOptions, RetryPolicy};
use crate::worker::WorkerOptions;

/// Parse an optional environment variable with a default value.
macro_rules! parse_env {
    ($lookup:expr, $var_name:expr, $ty:ty, $default:expr) => {
        $lookup($var_name)
            .map(|v| v.trim().parse::<$ty>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse an optional boolean flag (`true/1/yes`, `false/0/no`).
macro_rules! parse_env_bool {
    ($lookup:expr, $var_name:expr, $default:expr) => {
        match $lookup($var_name).as_deref().map(str::trim) {
            None => $default,
            Some("1") | Some("true") | Some("yes") => true,
            Some("0") | Some("false") | Some("no") => false,
            Some(other) => bail!("Invalid {}: expected true or false, got '{}'", $var_name, other),
        }
    };
}

/// Where readings, jobs and cached results live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    /// Shared PostgreSQL database; required for standalone workers.
    Postgres,
    /// Process-local maps; the worker must run embedded.
    Memory,
}

/// Queue tuning, kept in the units the environment uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    pub initial_delay_ms: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub visibility_timeout_secs: u64,
    pub keep_completed: u32,
    pub keep_failed: u32,
}

impl QueueSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
            visibility_timeout: Duration::from_secs(self.visibility_timeout_secs),
        }
    }

    pub fn enqueue_options(&self) -> EnqueueOptions {
        EnqueueOptions {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            keep_completed: self.keep_completed,
            keep_failed: self.keep_failed,
        }
    }
}

/// Strongly typed application configuration.
///
/// All fields are immutable after loading, ensuring a consistent
/// configuration snapshot for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct Config {
    // ---
    pub store_backend: StoreBackend,

    /// PostgreSQL connection string; `None` for the memory backend.
    pub db_url: Option<String>,

    /// Maximum number of database connections in the pool.
    pub db_pool_max: u32,

    /// Address the HTTP API binds to.
    pub http_addr: SocketAddr,

    /// Run a worker task inside the API process.
    pub worker_embedded: bool,

    pub queue: QueueSettings,

    pub poll_interval_ms: u64,
    pub retention_days: u32,
    pub cleanup_interval_secs: u64,
}

/// Load configuration from environment variables with defaults.
///
/// Required:
/// - `DATABASE_URL` – PostgreSQL connection string (postgres backend only)
///
/// Optional:
/// - `STORE_BACKEND` – `postgres` (default) or `memory`
/// - `DB_POOL_MAX` – max DB connections (default: 5)
/// - `HTTP_ADDR` – bind address (default: `0.0.0.0:8080`)
/// - `WORKER_EMBEDDED` – run a worker in the API process (default: true)
/// - `QUEUE_*`, `WORKER_POLL_INTERVAL_MS`, `RETENTION_DAYS`,
///   `CLEANUP_INTERVAL_SECS` – queue and worker tuning
///
/// Returns an error if any required variable is missing or invalid.
pub fn load_from_env() -> Result<Config> {
    Config::from_lookup(|key| env::var(key).ok())
}

impl Config {
    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        // ---
        let store_backend = match lookup("STORE_BACKEND").as_deref().map(str::trim) {
            None | Some("postgres") => StoreBackend::Postgres,
            Some("memory") => StoreBackend::Memory,
            Some(other) => bail!("Invalid STORE_BACKEND: expected postgres or memory, got '{other}'"),
        };

        let db_url = match store_backend {
            StoreBackend::Postgres => Some(
                lookup("DATABASE_URL")
                    .ok_or_else(|| anyhow!("DATABASE_URL must be set in .env or environment"))?,
            ),
            StoreBackend::Memory => None,
        };

        let mut worker_embedded = parse_env_bool!(lookup, "WORKER_EMBEDDED", true);
        if store_backend == StoreBackend::Memory && !worker_embedded {
            tracing::warn!("STORE_BACKEND=memory has no shared queue; forcing WORKER_EMBEDDED=true");
            worker_embedded = true;
        }

        let queue = QueueSettings {
            initial_delay_ms: parse_env!(lookup, "QUEUE_INITIAL_DELAY_MS", u64, 1000),
            max_attempts: parse_env!(lookup, "QUEUE_MAX_ATTEMPTS", u32, 3),
            backoff_base_ms: parse_env!(lookup, "QUEUE_BACKOFF_BASE_MS", u64, 1000),
            backoff_max_ms: parse_env!(lookup, "QUEUE_BACKOFF_MAX_MS", u64, 60_000),
            visibility_timeout_secs: parse_env!(lookup, "QUEUE_VISIBILITY_TIMEOUT_SECS", u64, 300),
            keep_completed: parse_env!(lookup, "QUEUE_KEEP_COMPLETED", u32, 10),
            keep_failed: parse_env!(lookup, "QUEUE_KEEP_FAILED", u32, 5),
        };
        if queue.max_attempts == 0 {
            bail!("Invalid QUEUE_MAX_ATTEMPTS: must be at least 1");
        }

        let cleanup_interval_secs = parse_env!(lookup, "CLEANUP_INTERVAL_SECS", u64, 86_400);
        if cleanup_interval_secs == 0 {
            bail!("Invalid CLEANUP_INTERVAL_SECS: must be at least 1");
        }

        Ok(Config {
            store_backend,
            db_url,
            db_pool_max: parse_env!(lookup, "DB_POOL_MAX", u32, 5),
            http_addr: parse_env!(
                lookup,
                "HTTP_ADDR",
                SocketAddr,
                SocketAddr::from(([0, 0, 0, 0], 8080))
            ),
            worker_embedded,
            queue,
            poll_interval_ms: parse_env!(lookup, "WORKER_POLL_INTERVAL_MS", u64, 500),
            retention_days: parse_env!(lookup, "RETENTION_DAYS", u32, 30),
            cleanup_interval_secs,
        })
    }

    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            retention: chrono::Duration::days(i64::from(self.retention_days)),
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs),
            cleanup_options: self.queue.enqueue_options().immediate(),
        }
    }

    /// Log the loaded configuration, database password masked.
    pub fn log_config(&self) {
        // ---
        let masked_db_url = self.db_url.as_deref().map_or_else(|| "-".to_string(), mask_db_url);

        tracing::info!("Configuration loaded:");
        tracing::info!("  STORE_BACKEND                 : {:?}", self.store_backend);
        tracing::info!("  DATABASE_URL                  : {}", masked_db_url);
        tracing::info!("  DB_POOL_MAX                   : {}", self.db_pool_max);
        tracing::info!("  HTTP_ADDR                     : {}", self.http_addr);
        tracing::info!("  WORKER_EMBEDDED               : {}", self.worker_embedded);
        tracing::info!("  QUEUE_INITIAL_DELAY_MS        : {}", self.queue.initial_delay_ms);
        tracing::info!("  QUEUE_MAX_ATTEMPTS            : {}", self.queue.max_attempts);
        tracing::info!("  QUEUE_BACKOFF_BASE_MS         : {}", self.queue.backoff_base_ms);
        tracing::info!("  QUEUE_BACKOFF_MAX_MS          : {}", self.queue.backoff_max_ms);
        tracing::info!("  QUEUE_VISIBILITY_TIMEOUT_SECS : {}", self.queue.visibility_timeout_secs);
        tracing::info!("  QUEUE_KEEP_COMPLETED          : {}", self.queue.keep_completed);
        tracing::info!("  QUEUE_KEEP_FAILED             : {}", self.queue.keep_failed);
        tracing::info!("  WORKER_POLL_INTERVAL_MS       : {}", self.poll_interval_ms);
        tracing::info!("  RETENTION_DAYS                : {}", self.retention_days);
        tracing::info!("  CLEANUP_INTERVAL_SECS         : {}", self.cleanup_interval_secs);
    }
}

/// Replace the password of `user:password@host` URLs with `****`.
pub fn mask_db_url(url: &str) -> String {
    // ---
    if let Some(at_pos) = url.rfind('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            // `scheme://user@host` has no password
            if !url[colon_pos..].starts_with("://") {
                return format!("{}:****{}", &url[..colon_pos], &url[at_pos..]);
            }
        }
    }
    url.to_string()
}
