//! Tenant-facing entry points: onboarding, job and cron submission, workflow
//! triggers, and tenant-scoped reads.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::db::job_repository::{ExecutionFilter, OneOffSubmission, Page, SubmissionOutcome};
use crate::engine::cron::parse_schedule;
use crate::engine::fingerprint::{job_fingerprint, DedupCheck, FingerprintParams};
use crate::engine::key_rotation::SigningKeys;
use crate::engine::orchestrator::{self, WorkflowContext};
use crate::engine::rate_limiter::TokenBucket;
use crate::errors::{SchedulerError, SchedulerResult};
use crate::models::cron_job::{CronJob, CronJobUpdate, NewCronJob};
use crate::models::http::{validate_url, HttpRequest, HttpResponse, NewHttpRequest};
use crate::models::job_execution::JobExecution;
use crate::models::one_off_job::{NewOneOffJob, OneOffJob};
use crate::models::scheduled_job::{JobOrigin, NewScheduledJob, ScheduledJob};
use crate::models::tenant::{NewTenant, Tenant};
use crate::models::workflow::{NewWorkflow, Workflow, WorkflowStatus};
use crate::state::AppState;
use crate::utils::id::{new_id, CRON, JOB, ONE_OFF, REQUEST, TENANT, WORKFLOW};

pub async fn create_tenant(state: &AppState, new: NewTenant, now: DateTime<Utc>) -> SchedulerResult<Tenant> {
    let limits = new.limits.unwrap_or_default();
    limits.validate().map_err(SchedulerError::Validation)?;
    let default_retries = new.default_retries.unwrap_or(3);
    if default_retries < 0 {
        return Err(SchedulerError::validation("default_retries must not be negative"));
    }
    let bucket = TokenBucket::for_daily_budget(new.tokens_per_day, new.max_tokens, now)
        .map_err(SchedulerError::Validation)?;

    let tenant = Tenant {
        id: new_id(TENANT),
        bucket,
        limits,
        default_retries,
        signing_keys: SigningKeys::Unprovisioned,
        created_at: now,
    };
    state.tenants.create_tenant(&tenant).await?;
    info!(tenant_id = %tenant.id, "tenant created");
    Ok(tenant)
}

pub async fn load_tenant(state: &AppState, tenant_id: &str) -> SchedulerResult<Tenant> {
    state
        .tenants
        .find_tenant(tenant_id)
        .await?
        .ok_or(SchedulerError::NotFound("tenant"))
}

fn require_region(state: &AppState, region: &str) -> SchedulerResult<()> {
    if state.config.is_valid_region(region) {
        Ok(())
    } else {
        Err(SchedulerError::validation(format!("unknown region {}", region)))
    }
}

/// Limits shared by one-off and cron submissions, resolved against the tenant's ceilings.
struct ResolvedLimits {
    timeout_ms: Option<i32>,
    max_retries: i32,
    max_response_bytes: Option<i32>,
}

fn resolve_limits(
    tenant: &Tenant,
    request: Option<&NewHttpRequest>,
    timeout_ms: Option<i32>,
    max_retries: Option<i32>,
    max_response_bytes: Option<i32>,
) -> SchedulerResult<ResolvedLimits> {
    let limits = &tenant.limits;
    if let Some(request) = request {
        request.validate().map_err(SchedulerError::Validation)?;
        if request.body_len() > limits.max_request_bytes as usize {
            return Err(SchedulerError::validation(format!(
                "request body exceeds {} bytes",
                limits.max_request_bytes
            )));
        }
    }
    if let Some(timeout) = timeout_ms {
        if timeout <= 0 || timeout > limits.max_timeout_ms {
            return Err(SchedulerError::validation(format!(
                "timeout_ms must be within 1..={}",
                limits.max_timeout_ms
            )));
        }
    }
    if let Some(bytes) = max_response_bytes {
        if bytes <= 0 || bytes > limits.max_max_response_bytes {
            return Err(SchedulerError::validation(format!(
                "max_response_bytes must be within 1..={}",
                limits.max_max_response_bytes
            )));
        }
    }
    let max_retries = max_retries.unwrap_or(tenant.default_retries);
    if max_retries < 0 {
        return Err(SchedulerError::validation("max_retries must not be negative"));
    }
    Ok(ResolvedLimits {
        timeout_ms,
        max_retries,
        max_response_bytes,
    })
}

/// Validates and stores a one-off job. Admission and dedup happen in the store.
pub async fn submit_one_off(
    state: &AppState,
    tenant_id: &str,
    new: NewOneOffJob,
    now: DateTime<Utc>,
) -> SchedulerResult<SubmissionOutcome> {
    let tenant = load_tenant(state, tenant_id).await?;
    require_region(state, &new.region)?;
    let limits = resolve_limits(
        &tenant,
        Some(&new.request),
        new.timeout_ms,
        new.max_retries,
        new.max_response_bytes,
    )?;

    // Past or absent times all mean "now" and fingerprint alike.
    let requested_at = new.execute_at.filter(|at| *at > now);
    let execute_at = requested_at.unwrap_or(now);
    if execute_at > now + Duration::days(tenant.limits.max_delay_days as i64) {
        return Err(SchedulerError::validation(format!(
            "execute_at is more than {} days away",
            tenant.limits.max_delay_days
        )));
    }

    let request = new.request.into_request(new_id(REQUEST), now);
    let one_off = OneOffJob {
        id: new_id(ONE_OFF),
        tenant_id: tenant.id.clone(),
        region: new.region.clone(),
        request_id: request.id.clone(),
        execute_at,
        timeout_ms: limits.timeout_ms,
        max_retries: limits.max_retries,
        max_response_bytes: limits.max_response_bytes,
        created_at: now,
        deleted_at: None,
    };
    let hash = job_fingerprint(
        &request,
        &FingerprintParams {
            tenant_id: &tenant.id,
            region: &new.region,
            scheduled_at: requested_at,
            timeout_ms: limits.timeout_ms,
            max_retries: limits.max_retries,
            max_response_bytes: limits.max_response_bytes,
        },
    );
    let job = NewScheduledJob {
        id: new_id(JOB),
        hash,
        tenant_id: tenant.id.clone(),
        region: new.region,
        request_id: request.id.clone(),
        scheduled_at: execute_at,
        timeout_ms: limits.timeout_ms,
        max_retries: limits.max_retries,
        max_response_bytes: limits.max_response_bytes,
        attempt: 0,
        origin: JobOrigin::OneOff(one_off.id.clone()),
        retry_for_id: None,
    };

    let settings = state.settings();
    let dedup = DedupCheck {
        policy: settings.dedup_policy,
        since: now - settings.dedup_window,
    };
    let outcome = state
        .jobs
        .submit_one_off(&OneOffSubmission { request, one_off, job }, dedup, now)
        .await?;
    match &outcome {
        SubmissionOutcome::Created(job) => {
            info!(tenant_id = %tenant.id, job_id = %job.id, scheduled_at = %job.scheduled_at, "job submitted")
        }
        SubmissionOutcome::Collapsed(job) => {
            info!(tenant_id = %tenant.id, job_id = %job.id, "duplicate submission collapsed")
        }
    }
    Ok(outcome)
}

pub async fn create_cron_job(
    state: &AppState,
    tenant_id: &str,
    new: NewCronJob,
    now: DateTime<Utc>,
) -> SchedulerResult<CronJob> {
    let tenant = load_tenant(state, tenant_id).await?;
    require_region(state, &new.region)?;
    parse_schedule(&new.schedule).map_err(SchedulerError::Validation)?;
    let limits = resolve_limits(
        &tenant,
        Some(&new.request),
        new.timeout_ms,
        new.max_retries,
        new.max_response_bytes,
    )?;

    let request = new.request.into_request(new_id(REQUEST), now);
    let cron = CronJob {
        id: new_id(CRON),
        tenant_id: tenant.id.clone(),
        region: new.region,
        request_id: request.id.clone(),
        schedule: new.schedule,
        timeout_ms: limits.timeout_ms,
        max_retries: limits.max_retries,
        max_response_bytes: limits.max_response_bytes,
        last_scheduled_at: None,
        error: None,
        created_at: now,
        deleted_at: None,
    };
    state
        .crons
        .create_cron_job(&cron, &request, tenant.limits.max_cron_jobs)
        .await?;
    info!(tenant_id = %tenant.id, cron_id = %cron.id, schedule = %cron.schedule, "cron job created");
    Ok(cron)
}

/// Applies a partial update. Pending occurrences are dropped and the
/// schedule restarts from now; a disabled cron job is re-enabled.
pub async fn update_cron_job(
    state: &AppState,
    tenant_id: &str,
    cron_id: &str,
    update: CronJobUpdate,
    now: DateTime<Utc>,
) -> SchedulerResult<CronJob> {
    let tenant = load_tenant(state, tenant_id).await?;
    let current = cron_for_tenant(state, tenant_id, cron_id).await?;
    if let Some(region) = &update.region {
        require_region(state, region)?;
    }
    if let Some(schedule) = &update.schedule {
        parse_schedule(schedule).map_err(SchedulerError::Validation)?;
    }
    let limits = resolve_limits(
        &tenant,
        update.request.as_ref(),
        update.timeout_ms.or(current.timeout_ms),
        update.max_retries.or(Some(current.max_retries)),
        update.max_response_bytes.or(current.max_response_bytes),
    )?;

    let request = update
        .request
        .map(|request| request.into_request(new_id(REQUEST), now));
    let cron = CronJob {
        region: update.region.unwrap_or(current.region),
        request_id: request
            .as_ref()
            .map_or(current.request_id, |request| request.id.clone()),
        schedule: update.schedule.unwrap_or(current.schedule),
        timeout_ms: limits.timeout_ms,
        max_retries: limits.max_retries,
        max_response_bytes: limits.max_response_bytes,
        last_scheduled_at: None,
        error: None,
        ..current
    };
    if !state.crons.update_cron_job(&cron, request.as_ref(), now).await? {
        return Err(SchedulerError::NotFound("cron job"));
    }
    info!(tenant_id = %tenant.id, cron_id = %cron.id, schedule = %cron.schedule, "cron job updated");
    Ok(cron)
}

pub async fn cron_for_tenant(state: &AppState, tenant_id: &str, cron_id: &str) -> SchedulerResult<CronJob> {
    state
        .crons
        .find_cron_job(cron_id)
        .await?
        .filter(|cron| cron.tenant_id == tenant_id && cron.deleted_at.is_none())
        .ok_or(SchedulerError::NotFound("cron job"))
}

pub async fn list_cron_jobs(state: &AppState, tenant_id: &str, page: &Page) -> SchedulerResult<Vec<CronJob>> {
    state.crons.list_cron_jobs(tenant_id, page).await
}

pub async fn delete_cron_job(
    state: &AppState,
    tenant_id: &str,
    cron_id: &str,
    now: DateTime<Utc>,
) -> SchedulerResult<()> {
    if state.crons.delete_cron_job(tenant_id, cron_id, now).await? {
        info!(tenant_id = %tenant_id, cron_id = %cron_id, "cron job deleted");
        Ok(())
    } else {
        Err(SchedulerError::NotFound("cron job"))
    }
}

/// Stores a pending workflow and gives it its first tick.
pub async fn create_workflow(
    state: &AppState,
    tenant_id: &str,
    new: NewWorkflow,
    now: DateTime<Utc>,
) -> SchedulerResult<Workflow> {
    let tenant = load_tenant(state, tenant_id).await?;
    require_region(state, &new.region)?;
    validate_url(&new.implementation_url).map_err(SchedulerError::Validation)?;
    let max_retries = new.max_retries.unwrap_or(tenant.default_retries);
    if max_retries < 0 {
        return Err(SchedulerError::validation("max_retries must not be negative"));
    }

    let workflow = Workflow {
        id: new_id(WORKFLOW),
        tenant_id: tenant.id,
        region: new.region,
        implementation_url: new.implementation_url,
        context: new
            .context
            .unwrap_or_else(|| WorkflowContext::new(new.input.clone()).to_value()),
        input: new.input,
        max_retries,
        parent_workflow_id: None,
        status: WorkflowStatus::Pending,
        created_at: now,
        finished_at: None,
    };
    state.workflows.create_workflow(&workflow).await?;
    info!(tenant_id = %workflow.tenant_id, workflow_id = %workflow.id, "workflow created");

    if let Err(e) = orchestrator::tick_workflow(state, &workflow.id, now).await {
        warn!(workflow_id = %workflow.id, error = %e, "first workflow tick failed");
    }
    Ok(workflow)
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionDetails {
    pub execution: JobExecution,
    pub response: Option<HttpResponse>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobDetails {
    pub job: ScheduledJob,
    pub request: HttpRequest,
    pub execution: Option<ExecutionDetails>,
}

const DEFAULT_PAGE_SIZE: i64 = 15;
const MAX_PAGE_SIZE: i64 = 250;

pub fn page(after: Option<String>, limit: Option<i64>) -> Page {
    Page {
        after,
        limit: limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE),
    }
}

/// First attempts of the tenant's live one-off jobs, newest first.
pub async fn list_jobs(state: &AppState, tenant_id: &str, page: &Page) -> SchedulerResult<Vec<ScheduledJob>> {
    state.jobs.list_one_off_jobs(tenant_id, page).await
}

/// Cancels the one-off behind `job_id`. Attempts already leased or executed
/// are left alone.
pub async fn cancel_job(state: &AppState, tenant_id: &str, job_id: &str, now: DateTime<Utc>) -> SchedulerResult<()> {
    let job = job_for_tenant(state, tenant_id, job_id).await?;
    let JobOrigin::OneOff(one_off_id) = &job.origin else {
        return Err(SchedulerError::validation("only one-off jobs can be cancelled"));
    };
    if !state.jobs.cancel_one_off(tenant_id, one_off_id, now).await? {
        return Err(SchedulerError::NotFound("job"));
    }
    info!(tenant_id = %tenant_id, job_id = %job_id, one_off_id = %one_off_id, "job cancelled");
    Ok(())
}

/// Execution history with request and outcome attached to each job.
pub async fn list_executions(state: &AppState, filter: &ExecutionFilter) -> SchedulerResult<Vec<JobDetails>> {
    let jobs = state.jobs.list_executions(filter).await?;
    let mut details = Vec::with_capacity(jobs.len());
    for job in jobs {
        details.push(details_for(state, job).await?);
    }
    Ok(details)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobVerification {
    pub verified: bool,
    /// Hex SHA-256 of the request body, if the request had one.
    pub hash: Option<String>,
}

/// Lets a receiving endpoint confirm that a request carrying `job_id` was
/// really dispatched for this tenant.
pub async fn verify_job(state: &AppState, tenant_id: &str, job_id: &str) -> SchedulerResult<JobVerification> {
    let job = state
        .jobs
        .find_job(job_id)
        .await?
        .filter(|job| job.tenant_id == tenant_id && job.times_locked > 0);
    let Some(job) = job else {
        return Ok(JobVerification {
            verified: false,
            hash: None,
        });
    };
    let body = state
        .jobs
        .find_request(&job.request_id)
        .await?
        .and_then(|request| request.body);
    Ok(JobVerification {
        verified: true,
        hash: body.map(|body| hex::encode(Sha256::digest(body.as_bytes()))),
    })
}

async fn job_for_tenant(state: &AppState, tenant_id: &str, job_id: &str) -> SchedulerResult<ScheduledJob> {
    state
        .jobs
        .find_job(job_id)
        .await?
        .filter(|job| job.tenant_id == tenant_id)
        .ok_or(SchedulerError::NotFound("job"))
}

/// A job with its request and outcome, visible only to its own tenant.
pub async fn job_details(state: &AppState, tenant_id: &str, job_id: &str) -> SchedulerResult<JobDetails> {
    let job = job_for_tenant(state, tenant_id, job_id).await?;
    details_for(state, job).await
}

async fn details_for(state: &AppState, job: ScheduledJob) -> SchedulerResult<JobDetails> {
    let request = state
        .jobs
        .find_request(&job.request_id)
        .await?
        .ok_or(SchedulerError::NotFound("request"))?;

    let execution = match &job.execution_id {
        Some(id) => match state.jobs.find_execution(id).await? {
            Some(execution) => {
                let response = match execution.response_id() {
                    Some(id) => state.jobs.find_response(id).await?,
                    None => None,
                };
                Some(ExecutionDetails { execution, response })
            }
            None => None,
        },
        None => None,
    };
    Ok(JobDetails {
        job,
        request,
        execution,
    })
}

pub async fn workflow_for_tenant(state: &AppState, tenant_id: &str, workflow_id: &str) -> SchedulerResult<Workflow> {
    state
        .workflows
        .find_workflow(workflow_id)
        .await?
        .filter(|wf| wf.tenant_id == tenant_id)
        .ok_or(SchedulerError::NotFound("workflow"))
}
