//! Durable job queue decoupling ingestion from aggregation.
//!
//! Delivery is at-least-once. A claim hands out a lease; the lease holder
//! acknowledges or fails the job. A worker that dies mid-job never answers,
//! so its lease expires after the visibility timeout and the job becomes
//! claimable again. An expired lease counts as an attempt, the same as an
//! explicit failure. Failures are retried with exponential backoff until
//! `max_attempts`, then the job is dead-lettered in the `failed` state; a
//! job whose lease keeps expiring is dead-lettered at its next claim.

use std::{fmt, str::FromStr, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::QueueError;

mod memory;
mod postgres;

pub use memory::InMemoryJobQueue;
pub use postgres::PgJobQueue;

// ---

/// Routing tag of a job. Unrecognised tags survive a round trip through
/// the queue as [`JobKind::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JobKind {
    AggregateDaily,
    CleanOldData,
    Other(String),
}

impl JobKind {
    pub fn as_str(&self) -> &str {
        // ---
        match self {
            JobKind::AggregateDaily => "aggregateDaily",
            JobKind::CleanOldData => "cleanOldData",
            JobKind::Other(tag) => tag,
        }
    }
}

impl From<&str> for JobKind {
    fn from(tag: &str) -> Self {
        // ---
        match tag {
            "aggregateDaily" => JobKind::AggregateDaily,
            "cleanOldData" => JobKind::CleanOldData,
            other => JobKind::Other(other.to_string()),
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Pending,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        // ---
        match self {
            JobState::Pending => "pending",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // ---
        match s {
            "pending" => Ok(JobState::Pending),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(format!("unknown job state '{other}'")),
        }
    }
}

/// Per-job enqueue options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Debounce before the job is first claimable.
    pub initial_delay: Duration,
    /// Completed jobs kept after this one finishes.
    pub keep_completed: u32,
    /// Failed jobs kept after this one is dead-lettered.
    pub keep_failed: u32,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            keep_completed: 10,
            keep_failed: 5,
        }
    }
}

impl EnqueueOptions {
    pub fn immediate(mut self) -> Self {
        self.initial_delay = Duration::ZERO;
        self
    }
}

/// Queue-wide retry and lease policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub visibility_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            visibility_timeout: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying a job that has failed `attempts` times:
    /// `base * 2^(attempts - 1)`, capped at `backoff_max`.
    pub fn backoff(&self, attempts: u32) -> Duration {
        // ---
        let exponent = attempts.saturating_sub(1).min(31);
        self.backoff_base
            .checked_mul(1u32 << exponent)
            .map_or(self.backoff_max, |d| d.min(self.backoff_max))
    }
}

/// A claimed job. `lease` identifies this particular claim.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    // ---
    pub id: Uuid,
    pub kind: JobKind,
    pub payload: Value,
    pub state: JobState,
    pub attempts: u32,
    pub max_attempts: u32,
    pub run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub lease: Uuid,
}

/// What the producer gets back from [`JobQueue::enqueue`].
#[derive(Debug, Clone, PartialEq)]
pub struct JobHandle {
    pub id: Uuid,
    pub kind: JobKind,
    pub run_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailOutcome {
    Retrying {
        attempt: u32,
        retry_at: DateTime<Utc>,
    },
    DeadLettered {
        attempts: u32,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Append a pending job. Never waits for a worker.
    async fn enqueue(
        &self,
        kind: JobKind,
        payload: Value,
        options: &EnqueueOptions,
    ) -> Result<JobHandle, QueueError>;

    /// Atomically lease one due job, or `None` when nothing is due.
    async fn claim(&self) -> Result<Option<Job>, QueueError>;

    /// Mark a leased job completed.
    async fn ack(&self, job: &Job) -> Result<(), QueueError>;

    /// Record a failure: reschedule with backoff or dead-letter.
    async fn fail(&self, job: &Job, error: &str) -> Result<FailOutcome, QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;
}

/// `last_error` of a job dead-lettered because its leases kept expiring.
const STALLED_ERROR: &str = "lease expired before the job was settled";

/// `now + delay`, saturating instead of overflowing.
fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    // ---
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
