use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use super::{
    EnqueueOptions, FailOutcome, Job, JobHandle, JobKind, JobQueue, JobState, QueueStats,
    RetryPolicy, STALLED_ERROR,
};
use crate::error::QueueError;

// ---

// A reclaimed (active, expired) row pays one attempt. Rows whose next
// attempt would reach the limit are left to `dead_letter_stalled`.
const CLAIM_SQL: &str = r#"
    UPDATE analytics_jobs
       SET attempts = CASE WHEN state = 'active' THEN attempts + 1 ELSE attempts END,
           state = 'active',
           lease_id = $1,
           locked_until = now() + make_interval(secs => $2)
     WHERE id = (
        SELECT id FROM analytics_jobs
         WHERE (state = 'pending' AND run_at <= now())
            OR (state = 'active' AND locked_until <= now()
                AND attempts + 1 < max_attempts)
         ORDER BY run_at, created_at
         FOR UPDATE SKIP LOCKED
         LIMIT 1
     )
    RETURNING id, kind, payload, state, attempts, max_attempts, run_at, created_at
"#;

/// Queue backed by the `analytics_jobs` table. Claims use
/// `FOR UPDATE SKIP LOCKED` so any number of workers can poll the same
/// table without handing one job to two of them.
#[derive(Clone)]
pub struct PgJobQueue {
    pool: PgPool,
    policy: RetryPolicy,
}

impl PgJobQueue {
    pub fn new(pool: PgPool, policy: RetryPolicy) -> Self {
        Self { pool, policy }
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    kind: String,
    payload: Value,
    state: String,
    attempts: i32,
    max_attempts: i32,
    run_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl JobRow {
    fn into_job(self, lease: Uuid) -> Result<Job, QueueError> {
        // ---
        Ok(Job {
            id: self.id,
            kind: JobKind::from(self.kind.as_str()),
            payload: self.payload,
            state: self.state.parse().map_err(QueueError::CorruptRow)?,
            attempts: to_u32(self.attempts),
            max_attempts: to_u32(self.max_attempts),
            run_at: self.run_at,
            created_at: self.created_at,
            lease,
        })
    }
}

#[derive(sqlx::FromRow)]
struct LeasedRow {
    attempts: i32,
    max_attempts: i32,
    keep_completed: i32,
    keep_failed: i32,
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(
        &self,
        kind: JobKind,
        payload: Value,
        options: &EnqueueOptions,
    ) -> Result<JobHandle, QueueError> {
        // ---
        let id = Uuid::new_v4();
        let run_at: DateTime<Utc> = sqlx::query_scalar(
            r#"
            INSERT INTO analytics_jobs
                (id, kind, payload, state, attempts, max_attempts,
                 run_at, created_at, keep_completed, keep_failed)
            VALUES ($1, $2, $3, 'pending', 0, $4,
                    now() + make_interval(secs => $5), now(), $6, $7)
            RETURNING run_at
            "#,
        )
        .bind(id)
        .bind(kind.as_str())
        .bind(payload)
        .bind(to_i32(self.policy.max_attempts))
        .bind(options.initial_delay.as_secs_f64())
        .bind(to_i32(options.keep_completed))
        .bind(to_i32(options.keep_failed))
        .fetch_one(&self.pool)
        .await?;

        Ok(JobHandle { id, kind, run_at })
    }

    async fn claim(&self) -> Result<Option<Job>, QueueError> {
        // ---
        dead_letter_stalled(&self.pool).await?;

        let lease = Uuid::new_v4();
        let row = sqlx::query_as::<_, JobRow>(CLAIM_SQL)
            .bind(lease)
            .bind(self.policy.visibility_timeout.as_secs_f64())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| r.into_job(lease)).transpose()
    }

    async fn ack(&self, job: &Job) -> Result<(), QueueError> {
        // ---
        let mut tx = self.pool.begin().await?;
        let leased = lock_leased(&mut tx, job).await?;

        sqlx::query(
            r#"
            UPDATE analytics_jobs
               SET state = 'completed', lease_id = NULL, locked_until = NULL,
                   finished_at = now()
             WHERE id = $1
            "#,
        )
        .bind(job.id)
        .execute(&mut *tx)
        .await?;

        prune(&mut tx, JobState::Completed, leased.keep_completed).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn fail(&self, job: &Job, error: &str) -> Result<FailOutcome, QueueError> {
        // ---
        let mut tx = self.pool.begin().await?;
        let leased = lock_leased(&mut tx, job).await?;
        let attempts = to_u32(leased.attempts) + 1;

        if attempts >= to_u32(leased.max_attempts) {
            sqlx::query(
                r#"
                UPDATE analytics_jobs
                   SET state = 'failed', attempts = $2, last_error = $3,
                       lease_id = NULL, locked_until = NULL, finished_at = now()
                 WHERE id = $1
                "#,
            )
            .bind(job.id)
            .bind(to_i32(attempts))
            .bind(error)
            .execute(&mut *tx)
            .await?;

            prune(&mut tx, JobState::Failed, leased.keep_failed).await?;
            tx.commit().await?;
            return Ok(FailOutcome::DeadLettered { attempts });
        }

        let retry_at: DateTime<Utc> = sqlx::query_scalar(
            r#"
            UPDATE analytics_jobs
               SET state = 'pending', attempts = $2, last_error = $3,
                   lease_id = NULL, locked_until = NULL,
                   run_at = now() + make_interval(secs => $4)
             WHERE id = $1
            RETURNING run_at
            "#,
        )
        .bind(job.id)
        .bind(to_i32(attempts))
        .bind(error)
        .bind(self.policy.backoff(attempts).as_secs_f64())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(FailOutcome::Retrying {
            attempt: attempts,
            retry_at,
        })
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        // ---
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM analytics_jobs GROUP BY state")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = QueueStats::default();
        for (state, count) in rows {
            let count = count.max(0) as u64;
            match state.parse().map_err(QueueError::CorruptRow)? {
                JobState::Pending => stats.pending = count,
                JobState::Active => stats.active = count,
                JobState::Completed => stats.completed = count,
                JobState::Failed => stats.failed = count,
            }
        }
        Ok(stats)
    }
}

/// Lock the job row, provided `job` still holds its lease.
async fn lock_leased(conn: &mut PgConnection, job: &Job) -> Result<LeasedRow, QueueError> {
    // ---
    sqlx::query_as::<_, LeasedRow>(
        r#"
        SELECT attempts, max_attempts, keep_completed, keep_failed
          FROM analytics_jobs
         WHERE id = $1 AND lease_id = $2 AND state = 'active'
           FOR UPDATE
        "#,
    )
    .bind(job.id)
    .bind(job.lease)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or(QueueError::LeaseLost(job.id))
}

/// Move expired leases that have used their last attempt to `failed`.
async fn dead_letter_stalled(pool: &PgPool) -> Result<(), QueueError> {
    // ---
    let mut tx = pool.begin().await?;
    let stalled: Vec<(Uuid, i32, i32)> = sqlx::query_as(
        r#"
        UPDATE analytics_jobs
           SET state = 'failed', attempts = attempts + 1, last_error = $1,
               lease_id = NULL, locked_until = NULL, finished_at = now()
         WHERE id IN (
            SELECT id FROM analytics_jobs
             WHERE state = 'active' AND locked_until <= now()
               AND attempts + 1 >= max_attempts
               FOR UPDATE SKIP LOCKED
         )
        RETURNING id, attempts, keep_failed
        "#,
    )
    .bind(STALLED_ERROR)
    .fetch_all(&mut *tx)
    .await?;

    if let Some(keep) = stalled.iter().map(|(_, _, keep)| *keep).max() {
        for (id, attempts, _) in &stalled {
            tracing::warn!(job_id = %id, attempts, "stalled job dead-lettered");
        }
        prune(&mut tx, JobState::Failed, keep).await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Delete finished jobs in `state` beyond the newest `keep`.
async fn prune(conn: &mut PgConnection, state: JobState, keep: i32) -> Result<u64, QueueError> {
    // ---
    let result = sqlx::query(
        r#"
        DELETE FROM analytics_jobs
         WHERE id IN (
            SELECT id FROM analytics_jobs
             WHERE state = $1
             ORDER BY finished_at DESC, created_at DESC
             OFFSET $2
         )
        "#,
    )
    .bind(state.as_str())
    .bind(i64::from(keep.max(0)))
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() > 0 {
        tracing::debug!(
            state = state.as_str(),
            removed = result.rows_affected(),
            "pruned finished jobs"
        );
    }
    Ok(result.rows_affected())
}

fn to_i32(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

fn to_u32(n: i32) -> u32 {
    u32::try_from(n).unwrap_or(0)
}
