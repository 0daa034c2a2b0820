use async_trait::async_trait;

use super::{JobContext, JobHandler};
use crate::analytics::{daily_statistics, day_window};
use crate::error::JobProcessingError;
use crate::models::AggregateDailyPayload;
use crate::queue::Job;

// ---

/// Recomputes today's per-field, per-type statistics and overwrites the
/// day's cache entry. Running it twice without new writes yields the same
/// cache value.
pub struct AggregateDaily;

#[async_trait]
impl JobHandler for AggregateDaily {
    async fn handle(&self, job: &Job, ctx: &JobContext) -> Result<(), JobProcessingError> {
        // ---
        let payload: AggregateDailyPayload = if job.payload.is_null() {
            AggregateDailyPayload::default()
        } else {
            serde_json::from_value(job.payload.clone()).map_err(|source| {
                JobProcessingError::Payload {
                    kind: job.kind.to_string(),
                    source,
                }
            })?
        };

        let (date, start) = day_window(ctx.now);
        let stats = daily_statistics(ctx.store.as_ref(), &payload.field_ids, start).await?;
        ctx.cache.put_daily_stats(date, &stats).await?;

        tracing::info!(
            %date,
            fields = payload.field_ids.len(),
            groups = stats.len(),
            "daily statistics cached"
        );
        Ok(())
    }
}

/// Deletes readings older than the retention window.
pub struct CleanOldData;

#[async_trait]
impl JobHandler for CleanOldData {
    async fn handle(&self, _job: &Job, ctx: &JobContext) -> Result<(), JobProcessingError> {
        // ---
        let cutoff = ctx.now - ctx.retention;
        let removed = ctx.store.delete_older_than(cutoff).await?;

        tracing::info!(%cutoff, removed, "old readings deleted");
        Ok(())
    }
}
