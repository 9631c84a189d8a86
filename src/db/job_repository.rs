use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::engine::fingerprint::DedupCheck;
use crate::engine::lease::{ExecutionReport, RecordedExecution};
use crate::engine::retry::RetryPolicy;
use crate::errors::SchedulerResult;
use crate::models::http::{HttpRequest, HttpResponse};
use crate::models::job_execution::JobExecution;
use crate::models::one_off_job::OneOffJob;
use crate::models::scheduled_job::{NewScheduledJob, ScheduledJob};

/// Everything a one-off submission writes, prepared by the caller.
#[derive(Debug, Clone)]
pub struct OneOffSubmission {
    pub request: HttpRequest,
    pub one_off: OneOffJob,
    pub job: NewScheduledJob,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmissionOutcome {
    Created(ScheduledJob),
    /// An identical submission inside the dedup window was returned instead.
    Collapsed(ScheduledJob),
}

/// Keyset page over rows ordered newest first. `after` is the id of the
/// last row the caller has already seen.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub after: Option<String>,
    pub limit: i64,
}

/// Tenant-scoped history query. `from` and `to` bound `scheduled_at`.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub tenant_id: String,
    pub completed: Option<bool>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub one_off_job_id: Option<String>,
    pub cron_job_id: Option<String>,
    pub page: Page,
}

impl SubmissionOutcome {
    pub fn job(&self) -> &ScheduledJob {
        match self {
            SubmissionOutcome::Created(job) | SubmissionOutcome::Collapsed(job) => job,
        }
    }
}

#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Dedup check, tenant admission and all inserts in one transaction.
    async fn submit_one_off(
        &self,
        submission: &OneOffSubmission,
        dedup: DedupCheck,
        now: DateTime<Utc>,
    ) -> SchedulerResult<SubmissionOutcome>;

    async fn find_job(&self, job_id: &str) -> SchedulerResult<Option<ScheduledJob>>;

    async fn find_one_off(&self, one_off_id: &str) -> SchedulerResult<Option<OneOffJob>>;

    async fn find_request(&self, request_id: &str) -> SchedulerResult<Option<HttpRequest>>;

    async fn find_response(&self, response_id: &str) -> SchedulerResult<Option<HttpResponse>>;

    async fn find_execution(&self, execution_id: &str) -> SchedulerResult<Option<JobExecution>>;

    /// First attempts of the tenant's live one-off jobs.
    async fn list_one_off_jobs(&self, tenant_id: &str, page: &Page) -> SchedulerResult<Vec<ScheduledJob>>;

    /// Soft-deletes the one-off and its not-yet-leased jobs. False when the
    /// one-off is missing, foreign or already cancelled.
    async fn cancel_one_off(&self, tenant_id: &str, one_off_id: &str, now: DateTime<Utc>) -> SchedulerResult<bool>;

    /// Live jobs of every origin matching `filter`.
    async fn list_executions(&self, filter: &ExecutionFilter) -> SchedulerResult<Vec<ScheduledJob>>;

    /// `job_id` followed by the jobs it retries, newest first.
    async fn retry_chain(&self, job_id: &str) -> SchedulerResult<Vec<ScheduledJob>>;

    /// Unleased, unexecuted, due jobs in `region`, oldest first.
    async fn lease_candidates(
        &self,
        region: &str,
        now: DateTime<Utc>,
        limit: i64,
    ) -> SchedulerResult<Vec<ScheduledJob>>;

    /// Nonce compare-and-swap. On success the nonce and `times_locked` are
    /// incremented and the lease assigned; any mismatch is `StaleLease`.
    async fn try_lease(
        &self,
        job_id: &str,
        expected_nonce: i64,
        drone_id: &str,
        region: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<ScheduledJob>;

    /// Stores the response and execution, closes the lease, applies the
    /// workflow step outcome and creates the retry job, atomically.
    async fn record_execution(
        &self,
        report: &ExecutionReport,
        retry: &RetryPolicy,
    ) -> SchedulerResult<RecordedExecution>;

    /// Leased jobs whose `leased_at + timeout + grace` is before `now`.
    async fn expired_leases(
        &self,
        now: DateTime<Utc>,
        default_timeout_ms: i32,
        grace: Duration,
        limit: i64,
    ) -> SchedulerResult<Vec<ScheduledJob>>;

    /// Clears the lease and bumps the nonce so the old holder's report is stale.
    async fn release_lease(&self, job_id: &str, expected_nonce: i64) -> SchedulerResult<()>;

    /// Closes the job with a failed execution and no retry.
    async fn escalate_lease(
        &self,
        job_id: &str,
        expected_nonce: i64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<JobExecution>;

    /// Soft-deletes executed jobs older than their tenant's retention window
    /// along with responses and requests nothing live refers to.
    async fn soft_delete_expired(&self, now: DateTime<Utc>) -> SchedulerResult<u64>;

    /// Hard-deletes rows soft-deleted before `deleted_before`.
    async fn purge_deleted(&self, deleted_before: DateTime<Utc>) -> SchedulerResult<u64>;
}
