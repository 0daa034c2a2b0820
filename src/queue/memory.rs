use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use super::{
    after, EnqueueOptions, FailOutcome, Job, JobHandle, JobKind, JobQueue, JobState, QueueStats,
    RetryPolicy, STALLED_ERROR,
};
use crate::error::QueueError;

// ---

struct JobRecord {
    // ---
    seq: u64,
    id: Uuid,
    kind: JobKind,
    payload: Value,
    state: JobState,
    attempts: u32,
    max_attempts: u32,
    run_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    lease: Option<Uuid>,
    locked_until: Option<DateTime<Utc>>,
    keep_completed: u32,
    keep_failed: u32,
    last_error: Option<String>,
    finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    fn is_due(&self, now: DateTime<Utc>) -> bool {
        // ---
        match self.state {
            JobState::Pending => self.run_at <= now,
            JobState::Active => self.locked_until.is_some_and(|t| t <= now),
            JobState::Completed | JobState::Failed => false,
        }
    }

    fn to_job(&self, lease: Uuid) -> Job {
        Job {
            id: self.id,
            kind: self.kind.clone(),
            payload: self.payload.clone(),
            state: self.state,
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            run_at: self.run_at,
            created_at: self.created_at,
            lease,
        }
    }
}

#[derive(Default)]
struct Inner {
    next_seq: u64,
    jobs: HashMap<Uuid, JobRecord>,
}

impl Inner {
    /// The record for `job`, provided this claim still holds the lease.
    fn leased(&mut self, job: &Job) -> Result<&mut JobRecord, QueueError> {
        // ---
        self.jobs
            .get_mut(&job.id)
            .filter(|r| r.state == JobState::Active && r.lease == Some(job.lease))
            .ok_or(QueueError::LeaseLost(job.id))
    }

    /// Drop the oldest finished jobs in `state` beyond `keep`.
    fn prune(&mut self, state: JobState, keep: u32) {
        // ---
        let mut finished: Vec<(DateTime<Utc>, u64, Uuid)> = self
            .jobs
            .values()
            .filter(|r| r.state == state)
            .map(|r| (r.finished_at.unwrap_or(r.created_at), r.seq, r.id))
            .collect();
        finished.sort_by(|a, b| b.cmp(a));

        for (_, _, id) in finished.into_iter().skip(keep as usize) {
            self.jobs.remove(&id);
        }
    }
}

/// Process-local queue with the same claim, lease and retention rules as
/// [`super::PgJobQueue`]. Only usable when producer and worker share a
/// process.
pub struct InMemoryJobQueue {
    policy: RetryPolicy,
    inner: Mutex<Inner>,
}

impl InMemoryJobQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Every retained job in enqueue order, for inspection.
    pub fn snapshot(&self) -> Vec<(Job, Option<String>)> {
        // ---
        let inner = self.inner.lock();
        let mut records: Vec<&JobRecord> = inner.jobs.values().collect();
        records.sort_by_key(|r| r.seq);
        records
            .into_iter()
            .map(|r| (r.to_job(r.lease.unwrap_or_default()), r.last_error.clone()))
            .collect()
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(
        &self,
        kind: JobKind,
        payload: Value,
        options: &EnqueueOptions,
    ) -> Result<JobHandle, QueueError> {
        // ---
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let record = JobRecord {
            seq,
            id: Uuid::new_v4(),
            kind: kind.clone(),
            payload,
            state: JobState::Pending,
            attempts: 0,
            max_attempts: self.policy.max_attempts,
            run_at: after(now, options.initial_delay),
            created_at: now,
            lease: None,
            locked_until: None,
            keep_completed: options.keep_completed,
            keep_failed: options.keep_failed,
            last_error: None,
            finished_at: None,
        };
        let handle = JobHandle {
            id: record.id,
            kind,
            run_at: record.run_at,
        };
        inner.jobs.insert(record.id, record);

        Ok(handle)
    }

    async fn claim(&self) -> Result<Option<Job>, QueueError> {
        // ---
        let now = Utc::now();
        let mut inner = self.inner.lock();

        loop {
            let Some(id) = inner
                .jobs
                .values()
                .filter(|r| r.is_due(now))
                .min_by_key(|r| (r.run_at, r.seq))
                .map(|r| r.id)
            else {
                return Ok(None);
            };
            let Some(record) = inner.jobs.get_mut(&id) else {
                return Ok(None);
            };

            // Due while active means the previous lease expired.
            if record.state == JobState::Active {
                record.attempts += 1;
                if record.attempts >= record.max_attempts {
                    record.state = JobState::Failed;
                    record.lease = None;
                    record.locked_until = None;
                    record.finished_at = Some(now);
                    record.last_error = Some(STALLED_ERROR.to_string());
                    let (attempts, keep) = (record.attempts, record.keep_failed);
                    tracing::warn!(job_id = %id, attempts, "stalled job dead-lettered");
                    inner.prune(JobState::Failed, keep);
                    continue;
                }
            }

            let lease = Uuid::new_v4();
            record.state = JobState::Active;
            record.lease = Some(lease);
            record.locked_until = Some(after(now, self.policy.visibility_timeout));
            return Ok(Some(record.to_job(lease)));
        }
    }

    async fn ack(&self, job: &Job) -> Result<(), QueueError> {
        // ---
        let mut inner = self.inner.lock();
        let record = inner.leased(job)?;
        record.state = JobState::Completed;
        record.lease = None;
        record.locked_until = None;
        record.finished_at = Some(Utc::now());
        let keep = record.keep_completed;

        inner.prune(JobState::Completed, keep);
        Ok(())
    }

    async fn fail(&self, job: &Job, error: &str) -> Result<FailOutcome, QueueError> {
        // ---
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let record = inner.leased(job)?;

        record.attempts += 1;
        record.lease = None;
        record.locked_until = None;
        record.last_error = Some(error.to_string());

        if record.attempts >= record.max_attempts {
            record.state = JobState::Failed;
            record.finished_at = Some(now);
            let (attempts, keep) = (record.attempts, record.keep_failed);
            inner.prune(JobState::Failed, keep);
            return Ok(FailOutcome::DeadLettered { attempts });
        }

        record.state = JobState::Pending;
        record.run_at = after(now, self.policy.backoff(record.attempts));
        Ok(FailOutcome::Retrying {
            attempt: record.attempts,
            retry_at: record.run_at,
        })
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        // ---
        let inner = self.inner.lock();
        let mut stats = QueueStats::default();
        for record in inner.jobs.values() {
            match record.state {
                JobState::Pending => stats.pending += 1,
                JobState::Active => stats.active += 1,
                JobState::Completed => stats.completed += 1,
                JobState::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}
