use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgConnection, PgPool};
use std::collections::HashSet;

use super::job_repository::{ExecutionFilter, JobRepository, OneOffSubmission, Page, SubmissionOutcome};
use super::postgres_tenant_repository::admit_in_tx;
use super::postgres_workflow_repository::mark_step;
use crate::engine::fingerprint::{DedupCheck, DedupPolicy};
use crate::engine::lease::{prepare_escalation, prepare_execution, ExecutionReport, RecordedExecution};
use crate::engine::orchestrator::StepOutcome;
use crate::engine::retry::RetryPolicy;
use crate::errors::{SchedulerError, SchedulerResult};
use crate::models::http::{HttpRequest, HttpResponse};
use crate::models::job_execution::{JobExecution, JobExecutionRow};
use crate::models::one_off_job::OneOffJob;
use crate::models::scheduled_job::{NewScheduledJob, ScheduledJob, ScheduledJobRow};
use crate::models::workflow_execution::ExecutionStatus;

pub(crate) const JOB_COLUMNS: &str = "id, hash, tenant_id, region, request_id, scheduled_at, timeout_ms, \
     max_retries, max_response_bytes, attempt, lock_nonce, times_locked, leased_by, leased_at, \
     one_off_job_id, cron_job_id, workflow_execution_id, retry_for_id, execution_id, created_at, deleted_at";

const REQUEST_COLUMNS: &str = "id, method, url, headers, body, bytes_used, created_at, deleted_at";

const ONE_OFF_COLUMNS: &str = "id, tenant_id, region, request_id, execute_at, timeout_ms, max_retries, \
     max_response_bytes, created_at, deleted_at";

pub struct PostgresJobRepository {
    pub pool: PgPool,
}

fn into_jobs(rows: Vec<ScheduledJobRow>) -> SchedulerResult<Vec<ScheduledJob>> {
    rows.into_iter().map(ScheduledJob::try_from).collect()
}

pub(crate) async fn insert_request(conn: &mut PgConnection, request: &HttpRequest) -> SchedulerResult<()> {
    sqlx::query(
        r#"
        INSERT INTO http_requests (id, method, url, headers, body, bytes_used, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(&request.id)
    .bind(&request.method)
    .bind(&request.url)
    .bind(&request.headers)
    .bind(&request.body)
    .bind(request.bytes_used)
    .bind(request.created_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub(crate) async fn insert_job(
    conn: &mut PgConnection,
    job: &NewScheduledJob,
    now: DateTime<Utc>,
) -> SchedulerResult<ScheduledJob> {
    let (one_off_job_id, cron_job_id, workflow_execution_id) = job.origin.columns();
    let sql = format!(
        r#"
        INSERT INTO scheduled_jobs (
            id, hash, tenant_id, region, request_id, scheduled_at, timeout_ms, max_retries,
            max_response_bytes, attempt, one_off_job_id, cron_job_id, workflow_execution_id,
            retry_for_id, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        RETURNING {}
        "#,
        JOB_COLUMNS
    );
    let row = sqlx::query_as::<_, ScheduledJobRow>(&sql)
        .bind(&job.id)
        .bind(&job.hash)
        .bind(&job.tenant_id)
        .bind(&job.region)
        .bind(&job.request_id)
        .bind(job.scheduled_at)
        .bind(job.timeout_ms)
        .bind(job.max_retries)
        .bind(job.max_response_bytes)
        .bind(job.attempt)
        .bind(one_off_job_id)
        .bind(cron_job_id)
        .bind(workflow_execution_id)
        .bind(&job.retry_for_id)
        .bind(now)
        .fetch_one(&mut *conn)
        .await?;
    ScheduledJob::try_from(row)
}

async fn lock_job(conn: &mut PgConnection, job_id: &str) -> SchedulerResult<ScheduledJob> {
    let sql = format!("SELECT {} FROM scheduled_jobs WHERE id = $1 FOR UPDATE", JOB_COLUMNS);
    let row = sqlx::query_as::<_, ScheduledJobRow>(&sql)
        .bind(job_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(SchedulerError::NotFound("job"))?;
    ScheduledJob::try_from(row)
}

async fn insert_execution(conn: &mut PgConnection, execution: &JobExecution) -> SchedulerResult<()> {
    sqlx::query(
        r#"
        INSERT INTO job_executions (id, job_id, drone_id, request_id, success, response_id, response_error, executed_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(&execution.id)
    .bind(&execution.job_id)
    .bind(&execution.drone_id)
    .bind(&execution.request_id)
    .bind(execution.success)
    .bind(execution.response_id())
    .bind(execution.response_error())
    .bind(execution.executed_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn close_job(conn: &mut PgConnection, job_id: &str, execution_id: &str) -> SchedulerResult<()> {
    sqlx::query(
        "UPDATE scheduled_jobs SET execution_id = $2, leased_by = NULL, leased_at = NULL WHERE id = $1",
    )
    .bind(job_id)
    .bind(execution_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

impl PostgresJobRepository {
    /// Distinguishes a lost race from a missing job after a guarded update matched nothing.
    async fn stale_or_missing(&self, job_id: &str) -> SchedulerError {
        match sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM scheduled_jobs WHERE id = $1)")
            .bind(job_id)
            .fetch_one(&self.pool)
            .await
        {
            Ok(true) => SchedulerError::stale(job_id),
            Ok(false) => SchedulerError::NotFound("job"),
            Err(e) => e.into(),
        }
    }
}

#[async_trait]
impl JobRepository for PostgresJobRepository {
    async fn submit_one_off(
        &self,
        submission: &OneOffSubmission,
        dedup: DedupCheck,
        now: DateTime<Utc>,
    ) -> SchedulerResult<SubmissionOutcome> {
        let job = &submission.job;
        let mut tx = self.pool.begin().await?;

        if dedup.policy != DedupPolicy::Allow {
            // Serializes concurrent submissions of the same fingerprint.
            sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1 || ':' || $2))")
                .bind(&job.tenant_id)
                .bind(&job.hash)
                .execute(&mut *tx)
                .await?;
            let sql = format!(
                r#"
                SELECT {} FROM scheduled_jobs
                WHERE tenant_id = $1 AND hash = $2 AND created_at >= $3 AND deleted_at IS NULL
                ORDER BY created_at
                LIMIT 1
                "#,
                JOB_COLUMNS
            );
            let existing = sqlx::query_as::<_, ScheduledJobRow>(&sql)
                .bind(&job.tenant_id)
                .bind(&job.hash)
                .bind(dedup.since)
                .fetch_optional(&mut *tx)
                .await?;
            if let Some(row) = existing {
                let existing = ScheduledJob::try_from(row)?;
                return match dedup.policy {
                    DedupPolicy::Collapse => Ok(SubmissionOutcome::Collapsed(existing)),
                    _ => Err(SchedulerError::Conflict(format!(
                        "duplicate of job {}",
                        existing.id
                    ))),
                };
            }
        }

        admit_in_tx(&mut tx, &job.tenant_id, 1, now).await?;
        insert_request(&mut tx, &submission.request).await?;

        let one_off = &submission.one_off;
        sqlx::query(
            r#"
            INSERT INTO one_off_jobs (
                id, tenant_id, region, request_id, execute_at, timeout_ms,
                max_retries, max_response_bytes, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&one_off.id)
        .bind(&one_off.tenant_id)
        .bind(&one_off.region)
        .bind(&one_off.request_id)
        .bind(one_off.execute_at)
        .bind(one_off.timeout_ms)
        .bind(one_off.max_retries)
        .bind(one_off.max_response_bytes)
        .bind(one_off.created_at)
        .execute(&mut *tx)
        .await?;

        let created = insert_job(&mut tx, job, now).await?;
        tx.commit().await?;
        Ok(SubmissionOutcome::Created(created))
    }

    async fn find_job(&self, job_id: &str) -> SchedulerResult<Option<ScheduledJob>> {
        let sql = format!("SELECT {} FROM scheduled_jobs WHERE id = $1", JOB_COLUMNS);
        sqlx::query_as::<_, ScheduledJobRow>(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?
            .map(ScheduledJob::try_from)
            .transpose()
    }

    async fn find_one_off(&self, one_off_id: &str) -> SchedulerResult<Option<OneOffJob>> {
        let sql = format!("SELECT {} FROM one_off_jobs WHERE id = $1", ONE_OFF_COLUMNS);
        Ok(sqlx::query_as::<_, OneOffJob>(&sql)
            .bind(one_off_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn find_request(&self, request_id: &str) -> SchedulerResult<Option<HttpRequest>> {
        let sql = format!("SELECT {} FROM http_requests WHERE id = $1", REQUEST_COLUMNS);
        Ok(sqlx::query_as::<_, HttpRequest>(&sql)
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn find_response(&self, response_id: &str) -> SchedulerResult<Option<HttpResponse>> {
        Ok(sqlx::query_as::<_, HttpResponse>(
            "SELECT id, status, headers, body, bytes_used, created_at, deleted_at FROM http_responses WHERE id = $1",
        )
        .bind(response_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn find_execution(&self, execution_id: &str) -> SchedulerResult<Option<JobExecution>> {
        sqlx::query_as::<_, JobExecutionRow>(
            r#"
            SELECT id, job_id, drone_id, request_id, success, response_id, response_error, executed_at
            FROM job_executions
            WHERE id = $1
            "#,
        )
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await?
        .map(JobExecution::try_from)
        .transpose()
    }

    async fn list_one_off_jobs(&self, tenant_id: &str, page: &Page) -> SchedulerResult<Vec<ScheduledJob>> {
        let sql = format!(
            r#"
            SELECT {} FROM scheduled_jobs s
            WHERE tenant_id = $1
              AND retry_for_id IS NULL
              AND deleted_at IS NULL
              AND EXISTS (
                  SELECT 1 FROM one_off_jobs o WHERE o.id = s.one_off_job_id AND o.deleted_at IS NULL
              )
              AND ($2::text IS NULL OR (created_at, id) < (
                  SELECT created_at, id FROM scheduled_jobs WHERE id = $2 AND tenant_id = $1
              ))
            ORDER BY created_at DESC, id DESC
            LIMIT $3
            "#,
            JOB_COLUMNS
        );
        let rows = sqlx::query_as::<_, ScheduledJobRow>(&sql)
            .bind(tenant_id)
            .bind(&page.after)
            .bind(page.limit)
            .fetch_all(&self.pool)
            .await?;
        into_jobs(rows)
    }

    async fn cancel_one_off(&self, tenant_id: &str, one_off_id: &str, now: DateTime<Utc>) -> SchedulerResult<bool> {
        let mut tx = self.pool.begin().await?;
        let cancelled = sqlx::query(
            "UPDATE one_off_jobs SET deleted_at = $3 WHERE id = $1 AND tenant_id = $2 AND deleted_at IS NULL",
        )
        .bind(one_off_id)
        .bind(tenant_id)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if cancelled == 0 {
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET deleted_at = $2
            WHERE one_off_job_id = $1
              AND leased_by IS NULL
              AND execution_id IS NULL
              AND deleted_at IS NULL
            "#,
        )
        .bind(one_off_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn list_executions(&self, filter: &ExecutionFilter) -> SchedulerResult<Vec<ScheduledJob>> {
        let sql = format!(
            r#"
            SELECT {} FROM scheduled_jobs
            WHERE tenant_id = $1
              AND deleted_at IS NULL
              AND ($2::boolean IS NULL OR (execution_id IS NOT NULL) = $2)
              AND ($3::timestamptz IS NULL OR scheduled_at >= $3)
              AND ($4::timestamptz IS NULL OR scheduled_at < $4)
              AND ($5::text IS NULL OR one_off_job_id = $5)
              AND ($6::text IS NULL OR cron_job_id = $6)
              AND ($7::text IS NULL OR (created_at, id) < (
                  SELECT created_at, id FROM scheduled_jobs WHERE id = $7 AND tenant_id = $1
              ))
            ORDER BY created_at DESC, id DESC
            LIMIT $8
            "#,
            JOB_COLUMNS
        );
        let rows = sqlx::query_as::<_, ScheduledJobRow>(&sql)
            .bind(&filter.tenant_id)
            .bind(filter.completed)
            .bind(filter.from)
            .bind(filter.to)
            .bind(&filter.one_off_job_id)
            .bind(&filter.cron_job_id)
            .bind(&filter.page.after)
            .bind(filter.page.limit)
            .fetch_all(&self.pool)
            .await?;
        into_jobs(rows)
    }

    async fn retry_chain(&self, job_id: &str) -> SchedulerResult<Vec<ScheduledJob>> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut next = Some(job_id.to_string());
        while let Some(id) = next {
            if !seen.insert(id.clone()) {
                return Err(SchedulerError::Corrupt(format!("retry chain through {} loops", id)));
            }
            let Some(job) = self.find_job(&id).await? else { break };
            next = job.retry_for_id.clone();
            chain.push(job);
        }
        Ok(chain)
    }

    async fn lease_candidates(
        &self,
        region: &str,
        now: DateTime<Utc>,
        limit: i64,
    ) -> SchedulerResult<Vec<ScheduledJob>> {
        let sql = format!(
            r#"
            SELECT {} FROM scheduled_jobs
            WHERE region = $1
              AND leased_by IS NULL
              AND execution_id IS NULL
              AND deleted_at IS NULL
              AND scheduled_at <= $2
            ORDER BY scheduled_at, id
            LIMIT $3
            "#,
            JOB_COLUMNS
        );
        let rows = sqlx::query_as::<_, ScheduledJobRow>(&sql)
            .bind(region)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        into_jobs(rows)
    }

    async fn try_lease(
        &self,
        job_id: &str,
        expected_nonce: i64,
        drone_id: &str,
        region: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<ScheduledJob> {
        let sql = format!(
            r#"
            UPDATE scheduled_jobs
            SET lock_nonce = lock_nonce + 1,
                times_locked = times_locked + 1,
                leased_by = $3,
                leased_at = $5
            WHERE id = $1
              AND lock_nonce = $2
              AND region = $4
              AND leased_by IS NULL
              AND execution_id IS NULL
              AND deleted_at IS NULL
              AND scheduled_at <= $5
            RETURNING {}
            "#,
            JOB_COLUMNS
        );
        let row = sqlx::query_as::<_, ScheduledJobRow>(&sql)
            .bind(job_id)
            .bind(expected_nonce)
            .bind(drone_id)
            .bind(region)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => ScheduledJob::try_from(row),
            None => Err(self.stale_or_missing(job_id).await),
        }
    }

    async fn record_execution(
        &self,
        report: &ExecutionReport,
        retry: &RetryPolicy,
    ) -> SchedulerResult<RecordedExecution> {
        let mut tx = self.pool.begin().await?;
        let job = lock_job(&mut tx, &report.job_id).await?;
        let prepared = prepare_execution(&job, report, retry)?;

        if let Some(response) = &prepared.response {
            sqlx::query(
                r#"
                INSERT INTO http_responses (id, status, headers, body, bytes_used, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(&response.id)
            .bind(response.status)
            .bind(&response.headers)
            .bind(&response.body)
            .bind(response.bytes_used)
            .bind(response.created_at)
            .execute(&mut *tx)
            .await?;
        }
        insert_execution(&mut tx, &prepared.execution).await?;
        close_job(&mut tx, &job.id, &prepared.execution.id).await?;

        let workflow_execution = match prepared.step {
            Some((id, outcome)) => mark_step(&mut tx, &id, &outcome, report.executed_at).await?,
            None => None,
        };
        let retry = match &prepared.retry {
            Some(next) => Some(insert_job(&mut tx, next, report.executed_at).await?),
            None => None,
        };
        tx.commit().await?;

        Ok(RecordedExecution {
            execution: prepared.execution,
            response: prepared.response,
            retry,
            workflow_execution,
        })
    }

    async fn expired_leases(
        &self,
        now: DateTime<Utc>,
        default_timeout_ms: i32,
        grace: Duration,
        limit: i64,
    ) -> SchedulerResult<Vec<ScheduledJob>> {
        let columns = JOB_COLUMNS
            .split(", ")
            .map(|c| format!("j.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            r#"
            SELECT {} FROM scheduled_jobs j
            JOIN tenants t ON t.id = j.tenant_id
            WHERE j.leased_at IS NOT NULL
              AND j.execution_id IS NULL
              AND j.leased_at
                  + COALESCE(j.timeout_ms, LEAST($2, t.max_timeout_ms)) * INTERVAL '1 millisecond'
                  + $3 * INTERVAL '1 millisecond' < $1
            ORDER BY j.leased_at, j.id
            LIMIT $4
            "#,
            columns
        );
        let rows = sqlx::query_as::<_, ScheduledJobRow>(&sql)
            .bind(now)
            .bind(default_timeout_ms)
            .bind(grace.num_milliseconds() as f64)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        into_jobs(rows)
    }

    async fn release_lease(&self, job_id: &str, expected_nonce: i64) -> SchedulerResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET leased_by = NULL, leased_at = NULL, lock_nonce = lock_nonce + 1
            WHERE id = $1 AND lock_nonce = $2 AND leased_by IS NOT NULL AND execution_id IS NULL
            "#,
        )
        .bind(job_id)
        .bind(expected_nonce)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(self.stale_or_missing(job_id).await);
        }
        Ok(())
    }

    async fn escalate_lease(
        &self,
        job_id: &str,
        expected_nonce: i64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<JobExecution> {
        let mut tx = self.pool.begin().await?;
        let job = lock_job(&mut tx, job_id).await?;
        let execution = prepare_escalation(&job, expected_nonce, reason, now)?;

        insert_execution(&mut tx, &execution).await?;
        close_job(&mut tx, &job.id, &execution.id).await?;
        if let Some(step) = job.origin.workflow_execution_id() {
            let outcome = StepOutcome {
                status: ExecutionStatus::Failed,
                result_json: None,
                failure_reason: Some(reason.to_string()),
            };
            mark_step(&mut tx, step, &outcome, now).await?;
        }
        tx.commit().await?;
        Ok(execution)
    }

    async fn soft_delete_expired(&self, now: DateTime<Utc>) -> SchedulerResult<u64> {
        let mut tx = self.pool.begin().await?;

        let jobs = sqlx::query(
            r#"
            UPDATE scheduled_jobs j
            SET deleted_at = $1
            FROM job_executions e, tenants t
            WHERE e.id = j.execution_id
              AND t.id = j.tenant_id
              AND j.deleted_at IS NULL
              AND e.executed_at + t.retain_for_days * INTERVAL '1 day' < $1
            "#,
        )
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query(
            r#"
            UPDATE http_responses r
            SET deleted_at = $1
            FROM job_executions e
            JOIN scheduled_jobs j ON j.execution_id = e.id
            WHERE e.response_id = r.id
              AND j.deleted_at IS NOT NULL
              AND r.deleted_at IS NULL
            "#,
        )
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let one_offs = sqlx::query(
            r#"
            UPDATE one_off_jobs o
            SET deleted_at = $1
            WHERE o.deleted_at IS NULL
              AND o.execute_at < $1
              AND NOT EXISTS (
                SELECT 1 FROM scheduled_jobs j
                WHERE j.one_off_job_id = o.id AND j.deleted_at IS NULL
              )
            "#,
        )
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let requests = sqlx::query(
            r#"
            UPDATE http_requests r
            SET deleted_at = $1
            WHERE r.deleted_at IS NULL
              AND NOT EXISTS (SELECT 1 FROM scheduled_jobs j WHERE j.request_id = r.id AND j.deleted_at IS NULL)
              AND NOT EXISTS (SELECT 1 FROM one_off_jobs o WHERE o.request_id = r.id AND o.deleted_at IS NULL)
              AND NOT EXISTS (SELECT 1 FROM cron_jobs c WHERE c.request_id = r.id AND c.deleted_at IS NULL)
            "#,
        )
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(jobs + one_offs + requests)
    }

    async fn purge_deleted(&self, deleted_before: DateTime<Utc>) -> SchedulerResult<u64> {
        let mut tx = self.pool.begin().await?;
        let mut purged = 0;
        // Jobs go first: they reference one-offs, and their executions cascade.
        for sql in [
            "DELETE FROM scheduled_jobs WHERE deleted_at < $1",
            "DELETE FROM one_off_jobs WHERE deleted_at < $1",
            "DELETE FROM http_requests WHERE deleted_at < $1",
            "DELETE FROM http_responses WHERE deleted_at < $1",
        ] {
            purged += sqlx::query(sql)
                .bind(deleted_before)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(purged)
    }
}
