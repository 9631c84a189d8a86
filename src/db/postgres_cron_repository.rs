use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::cron_repository::{CronRepository, CronTick};
use super::job_repository::Page;
use super::postgres_job_repository::{insert_job, insert_request};
use super::postgres_tenant_repository::admit_in_tx;
use crate::errors::{SchedulerError, SchedulerResult};
use crate::models::cron_job::CronJob;
use crate::models::http::HttpRequest;
use crate::models::scheduled_job::NewScheduledJob;

const CRON_COLUMNS: &str = "id, tenant_id, region, request_id, schedule, timeout_ms, max_retries, \
     max_response_bytes, last_scheduled_at, error, created_at, deleted_at";

pub struct PostgresCronRepository {
    pub pool: PgPool,
}

#[async_trait]
impl CronRepository for PostgresCronRepository {
    async fn create_cron_job(&self, cron: &CronJob, request: &HttpRequest, max_cron_jobs: i32) -> SchedulerResult<()> {
        let mut tx = self.pool.begin().await?;
        // Holds the tenant row so concurrent creations see each other's count.
        sqlx::query("SELECT id FROM tenants WHERE id = $1 FOR UPDATE")
            .bind(&cron.tenant_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(SchedulerError::NotFound("tenant"))?;
        let live: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM cron_jobs WHERE tenant_id = $1 AND deleted_at IS NULL",
        )
        .bind(&cron.tenant_id)
        .fetch_one(&mut *tx)
        .await?;
        if live >= max_cron_jobs as i64 {
            return Err(SchedulerError::validation(format!(
                "tenant already has {} cron jobs",
                max_cron_jobs
            )));
        }

        insert_request(&mut tx, request).await?;
        sqlx::query(
            r#"
            INSERT INTO cron_jobs (
                id, tenant_id, region, request_id, schedule, timeout_ms,
                max_retries, max_response_bytes, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&cron.id)
        .bind(&cron.tenant_id)
        .bind(&cron.region)
        .bind(&cron.request_id)
        .bind(&cron.schedule)
        .bind(cron.timeout_ms)
        .bind(cron.max_retries)
        .bind(cron.max_response_bytes)
        .bind(cron.created_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn find_cron_job(&self, cron_id: &str) -> SchedulerResult<Option<CronJob>> {
        let sql = format!("SELECT {} FROM cron_jobs WHERE id = $1", CRON_COLUMNS);
        Ok(sqlx::query_as::<_, CronJob>(&sql)
            .bind(cron_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn list_cron_jobs(&self, tenant_id: &str, page: &Page) -> SchedulerResult<Vec<CronJob>> {
        let sql = format!(
            r#"
            SELECT {} FROM cron_jobs
            WHERE tenant_id = $1
              AND deleted_at IS NULL
              AND ($2::text IS NULL OR (created_at, id) < (
                  SELECT created_at, id FROM cron_jobs WHERE id = $2 AND tenant_id = $1
              ))
            ORDER BY created_at DESC, id DESC
            LIMIT $3
            "#,
            CRON_COLUMNS
        );
        Ok(sqlx::query_as::<_, CronJob>(&sql)
            .bind(tenant_id)
            .bind(&page.after)
            .bind(page.limit)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn update_cron_job(
        &self,
        cron: &CronJob,
        request: Option<&HttpRequest>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let mut tx = self.pool.begin().await?;
        let locked = sqlx::query_scalar::<_, String>(
            "SELECT id FROM cron_jobs WHERE id = $1 AND tenant_id = $2 AND deleted_at IS NULL FOR UPDATE",
        )
        .bind(&cron.id)
        .bind(&cron.tenant_id)
        .fetch_optional(&mut *tx)
        .await?;
        if locked.is_none() {
            return Ok(false);
        }

        if let Some(request) = request {
            insert_request(&mut tx, request).await?;
        }
        sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET deleted_at = $2
            WHERE cron_job_id = $1
              AND leased_by IS NULL
              AND execution_id IS NULL
              AND deleted_at IS NULL
            "#,
        )
        .bind(&cron.id)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            r#"
            UPDATE cron_jobs
            SET region = $2, request_id = $3, schedule = $4, timeout_ms = $5, max_retries = $6,
                max_response_bytes = $7, last_scheduled_at = $8, error = NULL
            WHERE id = $1
            "#,
        )
        .bind(&cron.id)
        .bind(&cron.region)
        .bind(&cron.request_id)
        .bind(&cron.schedule)
        .bind(cron.timeout_ms)
        .bind(cron.max_retries)
        .bind(cron.max_response_bytes)
        .bind(cron.last_scheduled_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn delete_cron_job(&self, tenant_id: &str, cron_id: &str, now: DateTime<Utc>) -> SchedulerResult<bool> {
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query(
            "UPDATE cron_jobs SET deleted_at = $3 WHERE id = $1 AND tenant_id = $2 AND deleted_at IS NULL",
        )
        .bind(cron_id)
        .bind(tenant_id)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if deleted == 0 {
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET deleted_at = $2
            WHERE cron_job_id = $1
              AND leased_by IS NULL
              AND execution_id IS NULL
              AND deleted_at IS NULL
            "#,
        )
        .bind(cron_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn cron_jobs_needing_ticks(&self, horizon: DateTime<Utc>, limit: i64) -> SchedulerResult<Vec<CronJob>> {
        let sql = format!(
            r#"
            SELECT {} FROM cron_jobs
            WHERE deleted_at IS NULL
              AND error IS NULL
              AND (last_scheduled_at IS NULL OR last_scheduled_at < $1)
            ORDER BY created_at, id
            LIMIT $2
            "#,
            CRON_COLUMNS
        );
        Ok(sqlx::query_as::<_, CronJob>(&sql)
            .bind(horizon)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn pending_count(&self, cron_id: &str) -> SchedulerResult<i64> {
        Ok(sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM scheduled_jobs
            WHERE cron_job_id = $1 AND execution_id IS NULL AND deleted_at IS NULL
            "#,
        )
        .bind(cron_id)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn schedule_occurrence(
        &self,
        cron_id: &str,
        job: &NewScheduledJob,
        now: DateTime<Utc>,
    ) -> SchedulerResult<CronTick> {
        let mut tx = self.pool.begin().await?;
        let sql = format!("SELECT {} FROM cron_jobs WHERE id = $1 FOR UPDATE", CRON_COLUMNS);
        let cron = sqlx::query_as::<_, CronJob>(&sql)
            .bind(cron_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(SchedulerError::NotFound("cron job"))?;
        let covered = cron
            .last_scheduled_at
            .map_or(false, |last| last >= job.scheduled_at);
        if cron.deleted_at.is_some() || covered {
            return Ok(CronTick::AlreadyScheduled);
        }

        let tick = match admit_in_tx(&mut tx, &job.tenant_id, 1, now).await {
            Ok(_) => CronTick::Scheduled(insert_job(&mut tx, job, now).await?),
            Err(SchedulerError::RateLimited { retry_at, .. }) => CronTick::RateLimited { retry_at },
            Err(e) => return Err(e),
        };
        sqlx::query("UPDATE cron_jobs SET last_scheduled_at = $2 WHERE id = $1")
            .bind(cron_id)
            .bind(job.scheduled_at)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(tick)
    }

    async fn mark_cron_error(&self, cron_id: &str, error: &str) -> SchedulerResult<()> {
        let result = sqlx::query("UPDATE cron_jobs SET error = $2 WHERE id = $1")
            .bind(cron_id)
            .bind(error)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(SchedulerError::NotFound("cron job"));
        }
        Ok(())
    }
}
