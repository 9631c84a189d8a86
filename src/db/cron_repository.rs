use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::job_repository::Page;
use crate::errors::SchedulerResult;
use crate::models::cron_job::CronJob;
use crate::models::http::HttpRequest;
use crate::models::scheduled_job::{NewScheduledJob, ScheduledJob};

#[derive(Debug, Clone, PartialEq)]
pub enum CronTick {
    Scheduled(ScheduledJob),
    /// Tenant was out of tokens; the occurrence is skipped but still recorded
    /// as materialized.
    RateLimited { retry_at: DateTime<Utc> },
    /// Another scheduler already covered this occurrence.
    AlreadyScheduled,
}

#[async_trait]
pub trait CronRepository: Send + Sync {
    /// Fails with a validation error when the tenant already has `max_cron_jobs` live jobs.
    async fn create_cron_job(
        &self,
        cron: &CronJob,
        request: &HttpRequest,
        max_cron_jobs: i32,
    ) -> SchedulerResult<()>;

    async fn find_cron_job(&self, cron_id: &str) -> SchedulerResult<Option<CronJob>>;

    async fn list_cron_jobs(&self, tenant_id: &str, page: &Page) -> SchedulerResult<Vec<CronJob>>;

    /// Replaces the live cron job's settings, storing `request` first when
    /// given. Pending occurrences are soft-deleted so the next tick
    /// rematerializes them. False when the cron job is missing or foreign.
    async fn update_cron_job(
        &self,
        cron: &CronJob,
        request: Option<&HttpRequest>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool>;

    /// Soft-deletes the cron job and its not-yet-leased future jobs.
    async fn delete_cron_job(
        &self,
        tenant_id: &str,
        cron_id: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool>;

    /// Live, error-free cron jobs not yet materialized up to `horizon`.
    async fn cron_jobs_needing_ticks(
        &self,
        horizon: DateTime<Utc>,
        limit: i64,
    ) -> SchedulerResult<Vec<CronJob>>;

    async fn pending_count(&self, cron_id: &str) -> SchedulerResult<i64>;

    /// Admits the tenant and inserts `job`, advancing `last_scheduled_at` to
    /// `job.scheduled_at`, in one transaction.
    async fn schedule_occurrence(
        &self,
        cron_id: &str,
        job: &NewScheduledJob,
        now: DateTime<Utc>,
    ) -> SchedulerResult<CronTick>;

    async fn mark_cron_error(&self, cron_id: &str, error: &str) -> SchedulerResult<()>;
}
