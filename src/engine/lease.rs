//! Optimistic-lock leasing of scheduled jobs by drones.
//!
//! A drone reads a candidate's `lock_nonce` and asks the store to swap it for
//! `nonce + 1` with itself as holder. Only one caller can win a given nonce;
//! everyone else gets `StaleLease` and moves on. The nonce handed out with the
//! lease is what the drone must present when it reports the outcome.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::engine::drone_registry;
use crate::engine::key_rotation;
use crate::engine::orchestrator::{self, StepOutcome};
use crate::engine::retry::{plan_retry, RetryPolicy};
use crate::errors::{SchedulerError, SchedulerResult};
use crate::models::http::{HttpResponse, NewHttpResponse};
use crate::models::job_execution::{ExecutionOutcome, JobExecution};
use crate::models::scheduled_job::{NewScheduledJob, ScheduledJob};
use crate::models::workflow_execution::WorkflowExecution;
use crate::state::AppState;
use crate::utils::id::{new_id, EXECUTION, RESPONSE};
use crate::utils::signing::{self, JOB_ID_HEADER, SIGNATURE_HEADER};

/// What the drone observed: a response of any status, or a transport error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportedResult {
    Response(NewHttpResponse),
    Error(String),
}

impl ReportedResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ReportedResult::Response(r) if r.is_success())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub job_id: String,
    pub lock_nonce: i64,
    pub drone_id: String,
    pub executed_at: DateTime<Utc>,
    pub result: ReportedResult,
}

/// Rows written by a successful report.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedExecution {
    pub execution: JobExecution,
    pub response: Option<HttpResponse>,
    pub retry: Option<ScheduledJob>,
    pub workflow_execution: Option<WorkflowExecution>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeasedRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<String>,
    pub body: Option<String>,
}

/// Everything a drone needs to run a job and report back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeasedJob {
    pub job_id: String,
    pub lock_nonce: i64,
    pub tenant_id: String,
    pub region: String,
    pub scheduled_at: DateTime<Utc>,
    pub attempt: i32,
    pub timeout_ms: i32,
    pub max_response_bytes: i32,
    pub request: LeasedRequest,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimSummary {
    pub released: usize,
    pub escalated: usize,
}

pub const LEASE_EXHAUSTED: &str = "lease attempts exhausted";

/// Rows a report will write, computed from the locked job.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedExecution {
    pub response: Option<HttpResponse>,
    pub execution: JobExecution,
    pub retry: Option<NewScheduledJob>,
    /// `(workflow_execution_id, outcome)` for workflow step jobs.
    pub step: Option<(String, StepOutcome)>,
}

fn holds_lease(job: &ScheduledJob, nonce: i64, drone_id: Option<&str>) -> bool {
    match &job.lease {
        Some(lease) => {
            !job.is_executed()
                && job.lock_nonce == nonce
                && drone_id.map_or(true, |d| d == lease.drone_id)
        }
        None => false,
    }
}

/// Checks that the reporter still holds the lease and builds the rows to store.
/// Stores call this with the job row locked.
pub fn prepare_execution(
    job: &ScheduledJob,
    report: &ExecutionReport,
    policy: &RetryPolicy,
) -> SchedulerResult<PreparedExecution> {
    if !holds_lease(job, report.lock_nonce, Some(&report.drone_id)) {
        return Err(SchedulerError::stale(&job.id));
    }

    let (response, outcome) = match &report.result {
        ReportedResult::Response(r) => {
            let row = r.clone().into_response(new_id(RESPONSE), report.executed_at);
            let outcome = ExecutionOutcome::Response(row.id.clone());
            (Some(row), outcome)
        }
        ReportedResult::Error(e) => (None, ExecutionOutcome::Error(e.clone())),
    };
    let success = report.result.is_success();
    let execution = JobExecution::new(
        new_id(EXECUTION),
        job.id.clone(),
        Some(report.drone_id.clone()),
        job.request_id.clone(),
        success,
        outcome,
        report.executed_at,
    )?;

    Ok(PreparedExecution {
        response,
        execution,
        retry: if success {
            None
        } else {
            plan_retry(job, report.executed_at, policy)
        },
        step: job
            .origin
            .workflow_execution_id()
            .map(|id| (id.to_string(), orchestrator::step_outcome(&report.result))),
    })
}

/// Failed execution closing a job whose leases ran out.
pub fn prepare_escalation(
    job: &ScheduledJob,
    expected_nonce: i64,
    reason: &str,
    now: DateTime<Utc>,
) -> SchedulerResult<JobExecution> {
    if !holds_lease(job, expected_nonce, None) {
        return Err(SchedulerError::stale(&job.id));
    }
    JobExecution::new(
        new_id(EXECUTION),
        job.id.clone(),
        job.lease.as_ref().map(|l| l.drone_id.clone()),
        job.request_id.clone(),
        false,
        ExecutionOutcome::Error(reason.to_string()),
        now,
    )
}

/// Whether a release at `expected_nonce` still applies.
pub fn can_release(job: &ScheduledJob, expected_nonce: i64) -> bool {
    holds_lease(job, expected_nonce, None)
}

/// Leases the oldest due job in `region` for `drone_id`, or `None` when
/// nothing is available.
pub async fn lease_next(
    state: &AppState,
    drone_id: &str,
    region: &str,
    now: DateTime<Utc>,
) -> SchedulerResult<Option<LeasedJob>> {
    drone_registry::ensure_eligible(state, drone_id, region, now).await?;

    let candidates = state
        .jobs
        .lease_candidates(region, now, state.settings().lease_batch_size)
        .await?;

    for candidate in candidates {
        match state
            .jobs
            .try_lease(&candidate.id, candidate.lock_nonce, drone_id, region, now)
            .await
        {
            Ok(job) => {
                info!(
                    job_id = %job.id,
                    drone_id = %drone_id,
                    lock_nonce = job.lock_nonce,
                    times_locked = job.times_locked,
                    "job leased"
                );
                return leased_payload(state, job, now).await.map(Some);
            }
            Err(SchedulerError::StaleLease { job_id }) => {
                debug!(job_id = %job_id, drone_id = %drone_id, "lost lease race");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(None)
}

async fn leased_payload(
    state: &AppState,
    job: ScheduledJob,
    now: DateTime<Utc>,
) -> SchedulerResult<LeasedJob> {
    let tenant = state
        .tenants
        .find_tenant(&job.tenant_id)
        .await?
        .ok_or(SchedulerError::NotFound("tenant"))?;
    let request = state
        .jobs
        .find_request(&job.request_id)
        .await?
        .ok_or(SchedulerError::NotFound("request"))?;

    let mut headers = request.headers.clone();
    headers.push(format!("{}: {}", JOB_ID_HEADER, job.id));
    if let Some(key) = key_rotation::signing_key_material(state, &tenant).await? {
        match signing::sign(&key, now, &request.url, request.body.as_deref()) {
            Ok(sig) => headers.push(format!(
                "{}: {}",
                SIGNATURE_HEADER,
                signing::signature_header_value(&sig)
            )),
            Err(e) => warn!(job_id = %job.id, error = %e, "could not sign leased request"),
        }
    }

    let settings = state.settings();
    Ok(LeasedJob {
        timeout_ms: job.effective_timeout_ms(settings.default_timeout_ms, tenant.limits.max_timeout_ms),
        max_response_bytes: job
            .max_response_bytes
            .unwrap_or(tenant.limits.max_max_response_bytes),
        job_id: job.id,
        lock_nonce: job.lock_nonce,
        tenant_id: job.tenant_id,
        region: job.region,
        scheduled_at: job.scheduled_at,
        attempt: job.attempt,
        request: LeasedRequest {
            method: request.method,
            url: request.url,
            headers,
            body: request.body,
        },
    })
}

/// Records a drone's outcome. Fails with `StaleLease` unless the drone still
/// holds the lease at the reported nonce.
pub async fn report(state: &AppState, report: &ExecutionReport) -> SchedulerResult<RecordedExecution> {
    let recorded = state
        .jobs
        .record_execution(report, &state.settings().retry)
        .await?;

    info!(
        job_id = %report.job_id,
        drone_id = %report.drone_id,
        success = recorded.execution.success,
        "execution recorded"
    );
    if let Some(retry) = &recorded.retry {
        info!(
            job_id = %report.job_id,
            retry_id = %retry.id,
            scheduled_at = %retry.scheduled_at,
            "retry scheduled"
        );
    }
    Ok(recorded)
}

/// Frees leases held past their deadline. Jobs that have already been leased
/// `max_lease_attempts` times are closed with a failed execution instead.
pub async fn reclaim_expired_leases(state: &AppState, now: DateTime<Utc>) -> SchedulerResult<ReclaimSummary> {
    let settings = state.settings();
    let expired = state
        .jobs
        .expired_leases(
            now,
            settings.default_timeout_ms,
            settings.lease_grace,
            settings.lease_batch_size * 4,
        )
        .await?;

    let mut summary = ReclaimSummary::default();
    for job in expired {
        let holder = job.lease.as_ref().map(|l| l.drone_id.clone()).unwrap_or_default();
        let outcome = if job.times_locked >= settings.max_lease_attempts {
            let reason = format!("{} after {} leases", LEASE_EXHAUSTED, job.times_locked);
            state
                .jobs
                .escalate_lease(&job.id, job.lock_nonce, &reason, now)
                .await
                .map(|_| {
                    summary.escalated += 1;
                    warn!(job_id = %job.id, drone_id = %holder, "lease escalated to failure");
                })
        } else {
            state
                .jobs
                .release_lease(&job.id, job.lock_nonce)
                .await
                .map(|_| {
                    summary.released += 1;
                    info!(job_id = %job.id, drone_id = %holder, "expired lease released");
                })
        };
        match outcome {
            Ok(()) | Err(SchedulerError::StaleLease { .. }) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(summary)
}
