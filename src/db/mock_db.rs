//! In-memory store implementing every repository trait. One mutex guards the
//! whole store, so each trait method is a single atomic step like its
//! Postgres transaction counterpart.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use super::cron_repository::{CronRepository, CronTick};
use super::drone_repository::DroneRepository;
use super::job_repository::{ExecutionFilter, JobRepository, OneOffSubmission, Page, SubmissionOutcome};
use super::secret_repository::SecretRepository;
use super::tenant_repository::TenantRepository;
use super::workflow_repository::{
    DependencyState, StartExecution, StepEmission, WorkflowRepository, WorkflowSnapshot,
};
use crate::engine::fingerprint::{DedupCheck, DedupPolicy};
use crate::engine::key_rotation::SigningKeys;
use crate::engine::lease::{
    can_release, prepare_escalation, prepare_execution, ExecutionReport, RecordedExecution,
};
use crate::engine::orchestrator::StepOutcome;
use crate::engine::rate_limiter::{admit_tenant, TokenBucket};
use crate::engine::retry::RetryPolicy;
use crate::errors::{SchedulerError, SchedulerResult};
use crate::models::cron_job::CronJob;
use crate::models::drone::Drone;
use crate::models::http::{HttpRequest, HttpResponse};
use crate::models::job_execution::JobExecution;
use crate::models::one_off_job::OneOffJob;
use crate::models::scheduled_job::{JobOrigin, NewScheduledJob, ScheduledJob};
use crate::models::secret::Secret;
use crate::models::tenant::Tenant;
use crate::models::workflow::{Workflow, WorkflowStatus};
use crate::models::workflow_dependency::{DependencyKind, WorkflowDependency};
use crate::models::workflow_execution::{ExecutionStatus, WorkflowExecution};

#[derive(Default)]
struct Store {
    tenants: HashMap<String, Tenant>,
    secrets: HashMap<String, Secret>,
    requests: HashMap<String, HttpRequest>,
    responses: HashMap<String, HttpResponse>,
    jobs: HashMap<String, ScheduledJob>,
    executions: HashMap<String, JobExecution>,
    one_offs: HashMap<String, OneOffJob>,
    crons: HashMap<String, CronJob>,
    drones: HashMap<String, Drone>,
    workflows: HashMap<String, Workflow>,
    workflow_executions: HashMap<String, WorkflowExecution>,
    dependencies: HashMap<String, WorkflowDependency>,
}

impl Store {
    fn admit(&mut self, tenant_id: &str, cost: i32, now: DateTime<Utc>) -> SchedulerResult<TokenBucket> {
        let tenant = self
            .tenants
            .get_mut(tenant_id)
            .ok_or(SchedulerError::NotFound("tenant"))?;
        let mut bucket = tenant.bucket.clone();
        admit_tenant(&mut bucket, tenant_id, cost, now)?;
        tenant.bucket = bucket.clone();
        Ok(bucket)
    }

    fn insert_job(&mut self, job: &NewScheduledJob, now: DateTime<Utc>) -> ScheduledJob {
        let job = job.clone().into_job(now);
        self.jobs.insert(job.id.clone(), job.clone());
        job
    }

    /// Mirrors `scheduled_jobs_cron_occurrence_idx`: one live first attempt per
    /// cron occurrence. Retries are exempt.
    fn occurrence_taken(&self, job: &NewScheduledJob) -> bool {
        let JobOrigin::Cron(cron_id) = &job.origin else {
            return false;
        };
        job.retry_for_id.is_none()
            && self.jobs.values().any(|j| {
                j.retry_for_id.is_none()
                    && j.deleted_at.is_none()
                    && j.scheduled_at == job.scheduled_at
                    && matches!(&j.origin, JobOrigin::Cron(id) if id == cron_id)
            })
    }

    /// Lands a step outcome on a `scheduled` workflow execution.
    fn apply_step(
        &mut self,
        execution_id: &str,
        outcome: StepOutcome,
        executed_at: DateTime<Utc>,
    ) -> Option<WorkflowExecution> {
        let execution = self.workflow_executions.get_mut(execution_id)?;
        if execution.status != ExecutionStatus::Scheduled {
            return None;
        }
        execution.status = outcome.status;
        execution.result_json = outcome.result_json;
        execution.failure_reason = outcome.failure_reason;
        execution.executed_at = Some(executed_at);
        Some(execution.clone())
    }

    fn tenant_references(&self, secret_id: &str) -> usize {
        self.tenants
            .values()
            .filter(|t| t.signing_keys.verification_keys().contains(&secret_id))
            .count()
    }

    fn has_open_execution(&self, workflow_id: &str) -> bool {
        self.workflow_executions
            .values()
            .any(|e| e.workflow_id == workflow_id && !e.status.is_terminal())
    }
}

pub struct MockDb {
    store: Mutex<Store>,
    pub should_fail: bool,
}

impl Default for MockDb {
    fn default() -> Self {
        Self {
            store: Mutex::new(Store::default()),
            should_fail: false,
        }
    }
}

impl MockDb {
    pub fn failing() -> Self {
        Self {
            should_fail: true,
            ..Self::default()
        }
    }

    fn lock(&self) -> SchedulerResult<MutexGuard<'_, Store>> {
        if self.should_fail {
            return Err(sqlx::Error::Protocol("Mock DB failure".into()).into());
        }
        Ok(self.store.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

fn sorted_by<T, K: Ord>(mut items: Vec<T>, key: impl Fn(&T) -> K) -> Vec<T> {
    items.sort_by_key(|item| key(item));
    items
}

fn cap(limit: i64) -> usize {
    usize::try_from(limit).unwrap_or(0)
}

type PageKey = (DateTime<Utc>, String);

/// Newest first by `key`, strictly past `cursor`. A page whose cursor did not
/// resolve is empty.
fn page_of<T>(items: Vec<T>, page: &Page, cursor: Option<PageKey>, key: impl Fn(&T) -> PageKey) -> Vec<T> {
    if page.after.is_some() && cursor.is_none() {
        return Vec::new();
    }
    sorted_by(items, |item| Reverse(key(item)))
        .into_iter()
        .filter(|item| cursor.as_ref().map_or(true, |c| key(item) < *c))
        .take(cap(page.limit))
        .collect()
}

fn job_key(job: &ScheduledJob) -> PageKey {
    (job.created_at, job.id.clone())
}

fn cron_key(cron: &CronJob) -> PageKey {
    (cron.created_at, cron.id.clone())
}

#[async_trait]
impl TenantRepository for MockDb {
    async fn create_tenant(&self, tenant: &Tenant) -> SchedulerResult<()> {
        let mut store = self.lock()?;
        if store.tenants.contains_key(&tenant.id) {
            return Err(SchedulerError::Conflict(format!("tenant {} exists", tenant.id)));
        }
        store.tenants.insert(tenant.id.clone(), tenant.clone());
        Ok(())
    }

    async fn find_tenant(&self, tenant_id: &str) -> SchedulerResult<Option<Tenant>> {
        Ok(self.lock()?.tenants.get(tenant_id).cloned())
    }

    async fn admit(&self, tenant_id: &str, cost: i32, now: DateTime<Utc>) -> SchedulerResult<TokenBucket> {
        self.lock()?.admit(tenant_id, cost, now)
    }

    async fn refill_due(&self, now: DateTime<Utc>, limit: i64) -> SchedulerResult<u64> {
        let mut store = self.lock()?;
        let mut refilled = 0;
        for tenant in store
            .tenants
            .values_mut()
            .filter(|t| t.bucket.next_increment() <= now)
            .take(cap(limit))
        {
            if tenant.bucket.refill(now) {
                refilled += 1;
            }
        }
        Ok(refilled)
    }

    async fn replace_signing_keys(
        &self,
        tenant_id: &str,
        expected: &SigningKeys,
        next: &SigningKeys,
        new_secrets: &[Secret],
    ) -> SchedulerResult<()> {
        let mut store = self.lock()?;
        let tenant = store
            .tenants
            .get(tenant_id)
            .ok_or(SchedulerError::NotFound("tenant"))?;
        if tenant.signing_keys != *expected {
            return Err(SchedulerError::Conflict(
                "signing keys changed concurrently".into(),
            ));
        }
        for secret in new_secrets {
            store.secrets.insert(secret.id.clone(), secret.clone());
        }
        if let Some(tenant) = store.tenants.get_mut(tenant_id) {
            tenant.signing_keys = next.clone();
        }
        Ok(())
    }

    async fn tenants_with_due_promotion(&self, now: DateTime<Utc>, limit: i64) -> SchedulerResult<Vec<Tenant>> {
        let store = self.lock()?;
        let due = store
            .tenants
            .values()
            .filter(|t| t.signing_keys.is_promotion_due(now))
            .cloned()
            .collect();
        Ok(sorted_by(due, |t: &Tenant| t.id.clone())
            .into_iter()
            .take(cap(limit))
            .collect())
    }
}

#[async_trait]
impl SecretRepository for MockDb {
    async fn find_secret(&self, secret_id: &str) -> SchedulerResult<Option<Secret>> {
        Ok(self.lock()?.secrets.get(secret_id).cloned())
    }

    async fn live_secrets_wrapped_before(&self, master_key_id: i32, limit: i64) -> SchedulerResult<Vec<Secret>> {
        let store = self.lock()?;
        let live: HashSet<&str> = store
            .tenants
            .values()
            .flat_map(|t| t.signing_keys.verification_keys())
            .collect();
        let stale = store
            .secrets
            .values()
            .filter(|s| live.contains(s.id.as_str()) && s.envelope.master_key_id < master_key_id)
            .cloned()
            .collect();
        Ok(sorted_by(stale, |s: &Secret| s.id.clone())
            .into_iter()
            .take(cap(limit))
            .collect())
    }

    async fn supersede_secret(&self, old_secret_id: &str, replacement: &Secret) -> SchedulerResult<u64> {
        let mut store = self.lock()?;
        let references = store.tenant_references(old_secret_id);
        if references == 0 {
            return Ok(0);
        }
        store
            .secrets
            .insert(replacement.id.clone(), replacement.clone());
        for tenant in store.tenants.values_mut() {
            tenant.signing_keys = tenant
                .signing_keys
                .replace_secret(old_secret_id, &replacement.id);
        }
        Ok(references as u64)
    }
}

#[async_trait]
impl DroneRepository for MockDb {
    async fn upsert_checkin(&self, drone: &Drone) -> SchedulerResult<Drone> {
        self.lock()?.drones.insert(drone.id.clone(), drone.clone());
        Ok(drone.clone())
    }

    async fn find_drone(&self, drone_id: &str) -> SchedulerResult<Option<Drone>> {
        Ok(self.lock()?.drones.get(drone_id).cloned())
    }

    async fn eligible_drones(&self, region: &str, now: DateTime<Utc>) -> SchedulerResult<Vec<Drone>> {
        let store = self.lock()?;
        let alive = store
            .drones
            .values()
            .filter(|d| d.region == region && d.is_alive(now))
            .cloned()
            .collect();
        Ok(sorted_by(alive, |d: &Drone| d.id.clone()))
    }

    async fn purge_silent(&self, silent_since: DateTime<Utc>) -> SchedulerResult<u64> {
        let mut store = self.lock()?;
        let before = store.drones.len();
        store.drones.retain(|_, d| d.checkin_by >= silent_since);
        Ok((before - store.drones.len()) as u64)
    }
}

#[async_trait]
impl JobRepository for MockDb {
    async fn submit_one_off(
        &self,
        submission: &OneOffSubmission,
        dedup: DedupCheck,
        now: DateTime<Utc>,
    ) -> SchedulerResult<SubmissionOutcome> {
        let mut store = self.lock()?;
        let job = &submission.job;

        if dedup.policy != DedupPolicy::Allow {
            let existing = store
                .jobs
                .values()
                .filter(|j| {
                    j.tenant_id == job.tenant_id
                        && j.hash == job.hash
                        && j.created_at >= dedup.since
                        && j.deleted_at.is_none()
                })
                .min_by_key(|j| j.created_at)
                .cloned();
            if let Some(existing) = existing {
                return match dedup.policy {
                    DedupPolicy::Collapse => Ok(SubmissionOutcome::Collapsed(existing)),
                    _ => Err(SchedulerError::Conflict(format!(
                        "duplicate of job {}",
                        existing.id
                    ))),
                };
            }
        }

        store.admit(&job.tenant_id, 1, now)?;
        store
            .requests
            .insert(submission.request.id.clone(), submission.request.clone());
        store
            .one_offs
            .insert(submission.one_off.id.clone(), submission.one_off.clone());
        Ok(SubmissionOutcome::Created(store.insert_job(job, now)))
    }

    async fn find_job(&self, job_id: &str) -> SchedulerResult<Option<ScheduledJob>> {
        Ok(self.lock()?.jobs.get(job_id).cloned())
    }

    async fn find_one_off(&self, one_off_id: &str) -> SchedulerResult<Option<OneOffJob>> {
        Ok(self.lock()?.one_offs.get(one_off_id).cloned())
    }

    async fn find_request(&self, request_id: &str) -> SchedulerResult<Option<HttpRequest>> {
        Ok(self.lock()?.requests.get(request_id).cloned())
    }

    async fn find_response(&self, response_id: &str) -> SchedulerResult<Option<HttpResponse>> {
        Ok(self.lock()?.responses.get(response_id).cloned())
    }

    async fn find_execution(&self, execution_id: &str) -> SchedulerResult<Option<JobExecution>> {
        Ok(self.lock()?.executions.get(execution_id).cloned())
    }

    async fn list_one_off_jobs(&self, tenant_id: &str, page: &Page) -> SchedulerResult<Vec<ScheduledJob>> {
        let store = self.lock()?;
        let live_one_off = |job: &ScheduledJob| match &job.origin {
            JobOrigin::OneOff(id) => store.one_offs.get(id).map_or(false, |o| o.deleted_at.is_none()),
            _ => false,
        };
        let cursor = page
            .after
            .as_ref()
            .and_then(|id| store.jobs.get(id))
            .filter(|j| j.tenant_id == tenant_id)
            .map(job_key);
        let jobs = store
            .jobs
            .values()
            .filter(|j| j.tenant_id == tenant_id && j.retry_for_id.is_none() && j.deleted_at.is_none())
            .filter(|j| live_one_off(*j))
            .cloned()
            .collect();
        Ok(page_of(jobs, page, cursor, job_key))
    }

    async fn cancel_one_off(&self, tenant_id: &str, one_off_id: &str, now: DateTime<Utc>) -> SchedulerResult<bool> {
        let mut store = self.lock()?;
        match store.one_offs.get_mut(one_off_id) {
            Some(one_off) if one_off.tenant_id == tenant_id && one_off.deleted_at.is_none() => {
                one_off.deleted_at = Some(now);
            }
            _ => return Ok(false),
        }
        let origin = JobOrigin::OneOff(one_off_id.to_string());
        for job in store.jobs.values_mut() {
            let pending = job.lease.is_none() && job.execution_id.is_none() && job.deleted_at.is_none();
            if pending && job.origin == origin {
                job.deleted_at = Some(now);
            }
        }
        Ok(true)
    }

    async fn list_executions(&self, filter: &ExecutionFilter) -> SchedulerResult<Vec<ScheduledJob>> {
        let store = self.lock()?;
        let wanted = |j: &ScheduledJob| {
            let (one_off_id, cron_id, _) = j.origin.columns();
            j.tenant_id == filter.tenant_id
                && j.deleted_at.is_none()
                && filter.completed.map_or(true, |done| j.is_executed() == done)
                && filter.from.map_or(true, |from| j.scheduled_at >= from)
                && filter.to.map_or(true, |to| j.scheduled_at < to)
                && filter
                    .one_off_job_id
                    .as_deref()
                    .map_or(true, |id| one_off_id == Some(id))
                && filter.cron_job_id.as_deref().map_or(true, |id| cron_id == Some(id))
        };
        let cursor = filter
            .page
            .after
            .as_ref()
            .and_then(|id| store.jobs.get(id))
            .filter(|j| j.tenant_id == filter.tenant_id)
            .map(job_key);
        let jobs = store.jobs.values().filter(|j| wanted(*j)).cloned().collect();
        Ok(page_of(jobs, &filter.page, cursor, job_key))
    }

    async fn retry_chain(&self, job_id: &str) -> SchedulerResult<Vec<ScheduledJob>> {
        let store = self.lock()?;
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut next = Some(job_id.to_string());
        while let Some(id) = next {
            if !seen.insert(id.clone()) {
                return Err(SchedulerError::Corrupt(format!("retry chain through {} loops", id)));
            }
            let Some(job) = store.jobs.get(&id) else { break };
            next = job.retry_for_id.clone();
            chain.push(job.clone());
        }
        Ok(chain)
    }

    async fn lease_candidates(
        &self,
        region: &str,
        now: DateTime<Utc>,
        limit: i64,
    ) -> SchedulerResult<Vec<ScheduledJob>> {
        let store = self.lock()?;
        let due = store
            .jobs
            .values()
            .filter(|j| j.is_leaseable(region, now))
            .cloned()
            .collect();
        Ok(sorted_by(due, |j: &ScheduledJob| (j.scheduled_at, j.id.clone()))
            .into_iter()
            .take(cap(limit))
            .collect())
    }

    async fn try_lease(
        &self,
        job_id: &str,
        expected_nonce: i64,
        drone_id: &str,
        region: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<ScheduledJob> {
        let mut store = self.lock()?;
        let job = store
            .jobs
            .get_mut(job_id)
            .ok_or(SchedulerError::NotFound("job"))?;
        if job.lock_nonce != expected_nonce || !job.is_leaseable(region, now) {
            return Err(SchedulerError::stale(job_id));
        }
        job.lock_nonce += 1;
        job.times_locked += 1;
        job.lease = Some(crate::models::scheduled_job::Lease {
            drone_id: drone_id.to_string(),
            leased_at: now,
        });
        Ok(job.clone())
    }

    async fn record_execution(
        &self,
        report: &ExecutionReport,
        retry: &RetryPolicy,
    ) -> SchedulerResult<RecordedExecution> {
        let mut store = self.lock()?;
        let job = store
            .jobs
            .get(&report.job_id)
            .ok_or(SchedulerError::NotFound("job"))?;
        let prepared = prepare_execution(job, report, retry)?;
        if let Some(next) = &prepared.retry {
            if store.occurrence_taken(next) {
                return Err(SchedulerError::Conflict("cron occurrence already exists".into()));
            }
        }

        if let Some(response) = &prepared.response {
            store.responses.insert(response.id.clone(), response.clone());
        }
        store
            .executions
            .insert(prepared.execution.id.clone(), prepared.execution.clone());
        if let Some(job) = store.jobs.get_mut(&report.job_id) {
            job.execution_id = Some(prepared.execution.id.clone());
            job.lease = None;
        }
        let workflow_execution = match prepared.step {
            Some((id, outcome)) => store.apply_step(&id, outcome, report.executed_at),
            None => None,
        };
        let retry = prepared
            .retry
            .as_ref()
            .map(|job| store.insert_job(job, report.executed_at));

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
        let store = self.lock()?;
        let expired = store
            .jobs
            .values()
            .filter(|j| !j.is_executed())
            .filter(|j| {
                let max_timeout = store
                    .tenants
                    .get(&j.tenant_id)
                    .map(|t| t.limits.max_timeout_ms)
                    .unwrap_or(default_timeout_ms);
                j.lease_deadline(default_timeout_ms, max_timeout, grace)
                    .map_or(false, |deadline| deadline < now)
            })
            .cloned()
            .collect();
        Ok(sorted_by(expired, |j: &ScheduledJob| {
            (j.lease.as_ref().map(|l| l.leased_at), j.id.clone())
        })
        .into_iter()
        .take(cap(limit))
        .collect())
    }

    async fn release_lease(&self, job_id: &str, expected_nonce: i64) -> SchedulerResult<()> {
        let mut store = self.lock()?;
        let job = store
            .jobs
            .get_mut(job_id)
            .ok_or(SchedulerError::NotFound("job"))?;
        if !can_release(job, expected_nonce) {
            return Err(SchedulerError::stale(job_id));
        }
        job.lease = None;
        job.lock_nonce += 1;
        Ok(())
    }

    async fn escalate_lease(
        &self,
        job_id: &str,
        expected_nonce: i64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<JobExecution> {
        let mut store = self.lock()?;
        let job = store
            .jobs
            .get(job_id)
            .ok_or(SchedulerError::NotFound("job"))?;
        let execution = prepare_escalation(job, expected_nonce, reason, now)?;
        let step = job.origin.workflow_execution_id().map(str::to_string);

        store
            .executions
            .insert(execution.id.clone(), execution.clone());
        if let Some(job) = store.jobs.get_mut(job_id) {
            job.execution_id = Some(execution.id.clone());
            job.lease = None;
        }
        if let Some(step) = step {
            store.apply_step(
                &step,
                StepOutcome {
                    status: ExecutionStatus::Failed,
                    result_json: None,
                    failure_reason: Some(reason.to_string()),
                },
                now,
            );
        }
        Ok(execution)
    }

    async fn soft_delete_expired(&self, now: DateTime<Utc>) -> SchedulerResult<u64> {
        let mut store = self.lock()?;
        let Store {
            tenants,
            jobs,
            executions,
            one_offs,
            crons,
            requests,
            responses,
            ..
        } = &mut *store;
        let mut deleted = 0;

        for job in jobs.values_mut().filter(|j| j.deleted_at.is_none()) {
            let Some(execution) = job.execution_id.as_ref().and_then(|id| executions.get(id)) else {
                continue;
            };
            let retain = tenants
                .get(&job.tenant_id)
                .map(|t| t.limits.retain_for_days)
                .unwrap_or(0);
            if execution.executed_at + Duration::days(retain as i64) < now {
                job.deleted_at = Some(now);
                deleted += 1;
                if let Some(response_id) = execution.response_id() {
                    if let Some(response) = responses.get_mut(response_id) {
                        response.deleted_at.get_or_insert(now);
                    }
                }
            }
        }

        let live_jobs: HashSet<&str> = jobs
            .values()
            .filter(|j| j.deleted_at.is_none())
            .filter_map(|j| match &j.origin {
                JobOrigin::OneOff(id) => Some(id.as_str()),
                _ => None,
            })
            .collect();
        for one_off in one_offs.values_mut().filter(|o| o.deleted_at.is_none()) {
            if !live_jobs.contains(one_off.id.as_str()) && one_off.execute_at < now {
                one_off.deleted_at = Some(now);
                deleted += 1;
            }
        }

        let referenced: HashSet<&str> = jobs
            .values()
            .filter(|j| j.deleted_at.is_none())
            .map(|j| j.request_id.as_str())
            .chain(
                one_offs
                    .values()
                    .filter(|o| o.deleted_at.is_none())
                    .map(|o| o.request_id.as_str()),
            )
            .chain(
                crons
                    .values()
                    .filter(|c| c.deleted_at.is_none())
                    .map(|c| c.request_id.as_str()),
            )
            .collect();
        for request in requests.values_mut().filter(|r| r.deleted_at.is_none()) {
            if !referenced.contains(request.id.as_str()) {
                request.deleted_at = Some(now);
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn purge_deleted(&self, deleted_before: DateTime<Utc>) -> SchedulerResult<u64> {
        let mut store = self.lock()?;
        let expired = |deleted_at: Option<DateTime<Utc>>| deleted_at.map_or(false, |at| at < deleted_before);

        let purged_jobs: HashSet<String> = store
            .jobs
            .values()
            .filter(|j| expired(j.deleted_at))
            .map(|j| j.id.clone())
            .collect();
        let mut purged = purged_jobs.len();
        store.jobs.retain(|id, _| !purged_jobs.contains(id));
        store.executions.retain(|_, e| !purged_jobs.contains(&e.job_id));
        for job in store.jobs.values_mut() {
            if job.retry_for_id.as_ref().map_or(false, |id| purged_jobs.contains(id)) {
                job.retry_for_id = None;
            }
        }

        let before = store.one_offs.len() + store.requests.len() + store.responses.len();
        store.one_offs.retain(|_, o| !expired(o.deleted_at));
        store.requests.retain(|_, r| !expired(r.deleted_at));
        store.responses.retain(|_, r| !expired(r.deleted_at));
        purged += before - (store.one_offs.len() + store.requests.len() + store.responses.len());
        Ok(purged as u64)
    }
}

#[async_trait]
impl CronRepository for MockDb {
    async fn create_cron_job(&self, cron: &CronJob, request: &HttpRequest, max_cron_jobs: i32) -> SchedulerResult<()> {
        let mut store = self.lock()?;
        let live = store
            .crons
            .values()
            .filter(|c| c.tenant_id == cron.tenant_id && c.deleted_at.is_none())
            .count();
        if live >= max_cron_jobs.max(0) as usize {
            return Err(SchedulerError::validation(format!(
                "tenant already has {} cron jobs",
                max_cron_jobs
            )));
        }
        store.requests.insert(request.id.clone(), request.clone());
        store.crons.insert(cron.id.clone(), cron.clone());
        Ok(())
    }

    async fn find_cron_job(&self, cron_id: &str) -> SchedulerResult<Option<CronJob>> {
        Ok(self.lock()?.crons.get(cron_id).cloned())
    }

    async fn list_cron_jobs(&self, tenant_id: &str, page: &Page) -> SchedulerResult<Vec<CronJob>> {
        let store = self.lock()?;
        let cursor = page
            .after
            .as_ref()
            .and_then(|id| store.crons.get(id))
            .filter(|c| c.tenant_id == tenant_id)
            .map(cron_key);
        let crons = store
            .crons
            .values()
            .filter(|c| c.tenant_id == tenant_id && c.deleted_at.is_none())
            .cloned()
            .collect();
        Ok(page_of(crons, page, cursor, cron_key))
    }

    async fn update_cron_job(
        &self,
        cron: &CronJob,
        request: Option<&HttpRequest>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let mut store = self.lock()?;
        let live = store
            .crons
            .get(&cron.id)
            .map_or(false, |c| c.tenant_id == cron.tenant_id && c.deleted_at.is_none());
        if !live {
            return Ok(false);
        }
        if let Some(request) = request {
            store.requests.insert(request.id.clone(), request.clone());
        }
        let origin = JobOrigin::Cron(cron.id.clone());
        for job in store.jobs.values_mut() {
            let pending = job.lease.is_none() && job.execution_id.is_none() && job.deleted_at.is_none();
            if pending && job.origin == origin {
                job.deleted_at = Some(now);
            }
        }
        let mut updated = cron.clone();
        updated.error = None;
        store.crons.insert(cron.id.clone(), updated);
        Ok(true)
    }

    async fn delete_cron_job(&self, tenant_id: &str, cron_id: &str, now: DateTime<Utc>) -> SchedulerResult<bool> {
        let mut store = self.lock()?;
        match store.crons.get_mut(cron_id) {
            Some(cron) if cron.tenant_id == tenant_id && cron.deleted_at.is_none() => {
                cron.deleted_at = Some(now);
            }
            _ => return Ok(false),
        }
        for job in store.jobs.values_mut() {
            let pending = job.lease.is_none() && job.execution_id.is_none() && job.deleted_at.is_none();
            if pending && job.origin == JobOrigin::Cron(cron_id.to_string()) {
                job.deleted_at = Some(now);
            }
        }
        Ok(true)
    }

    async fn cron_jobs_needing_ticks(&self, horizon: DateTime<Utc>, limit: i64) -> SchedulerResult<Vec<CronJob>> {
        let store = self.lock()?;
        let behind = store
            .crons
            .values()
            .filter(|c| c.deleted_at.is_none() && c.error.is_none())
            .filter(|c| c.last_scheduled_at.map_or(true, |last| last < horizon))
            .cloned()
            .collect();
        Ok(sorted_by(behind, |c: &CronJob| (c.created_at, c.id.clone()))
            .into_iter()
            .take(cap(limit))
            .collect())
    }

    async fn pending_count(&self, cron_id: &str) -> SchedulerResult<i64> {
        let store = self.lock()?;
        let origin = JobOrigin::Cron(cron_id.to_string());
        Ok(store
            .jobs
            .values()
            .filter(|j| j.origin == origin && j.execution_id.is_none() && j.deleted_at.is_none())
            .count() as i64)
    }

    async fn schedule_occurrence(
        &self,
        cron_id: &str,
        job: &NewScheduledJob,
        now: DateTime<Utc>,
    ) -> SchedulerResult<CronTick> {
        let mut store = self.lock()?;
        let cron = store
            .crons
            .get(cron_id)
            .ok_or(SchedulerError::NotFound("cron job"))?;
        if cron.deleted_at.is_some()
            || cron
                .last_scheduled_at
                .map_or(false, |last| last >= job.scheduled_at)
            || store.occurrence_taken(job)
        {
            return Ok(CronTick::AlreadyScheduled);
        }

        let tick = match store.admit(&job.tenant_id, 1, now) {
            Ok(_) => CronTick::Scheduled(store.insert_job(job, now)),
            Err(SchedulerError::RateLimited { retry_at, .. }) => CronTick::RateLimited { retry_at },
            Err(e) => return Err(e),
        };
        if let Some(cron) = store.crons.get_mut(cron_id) {
            cron.last_scheduled_at = Some(job.scheduled_at);
        }
        Ok(tick)
    }

    async fn mark_cron_error(&self, cron_id: &str, error: &str) -> SchedulerResult<()> {
        let mut store = self.lock()?;
        let cron = store
            .crons
            .get_mut(cron_id)
            .ok_or(SchedulerError::NotFound("cron job"))?;
        cron.error = Some(error.to_string());
        Ok(())
    }
}

#[async_trait]
impl WorkflowRepository for MockDb {
    async fn create_workflow(&self, workflow: &Workflow) -> SchedulerResult<()> {
        let mut store = self.lock()?;
        if store.workflows.contains_key(&workflow.id) {
            return Err(SchedulerError::Conflict(format!("workflow {} exists", workflow.id)));
        }
        store.workflows.insert(workflow.id.clone(), workflow.clone());
        Ok(())
    }

    async fn find_workflow(&self, workflow_id: &str) -> SchedulerResult<Option<Workflow>> {
        Ok(self.lock()?.workflows.get(workflow_id).cloned())
    }

    async fn pending_workflow_ids(&self, limit: i64) -> SchedulerResult<Vec<String>> {
        let store = self.lock()?;
        let pending = store
            .workflows
            .values()
            .filter(|w| !w.status.is_terminal())
            .map(|w| (w.created_at, w.id.clone()))
            .collect();
        Ok(sorted_by(pending, |p: &(DateTime<Utc>, String)| p.clone())
            .into_iter()
            .map(|(_, id)| id)
            .take(cap(limit))
            .collect())
    }

    async fn load_snapshot(&self, workflow_id: &str) -> SchedulerResult<Option<WorkflowSnapshot>> {
        let store = self.lock()?;
        let Some(workflow) = store.workflows.get(workflow_id).cloned() else {
            return Ok(None);
        };
        let executions = sorted_by(
            store
                .workflow_executions
                .values()
                .filter(|e| e.workflow_id == workflow_id)
                .cloned()
                .collect(),
            |e: &WorkflowExecution| e.execution_index,
        );
        let execution_ids: HashSet<&str> = executions.iter().map(|e| e.id.as_str()).collect();
        let dependencies = sorted_by(
            store
                .dependencies
                .values()
                .filter(|d| execution_ids.contains(d.workflow_execution_id.as_str()))
                .map(|d| DependencyState {
                    dependency: d.clone(),
                    child_status: match &d.kind {
                        DependencyKind::ChildWorkflow { workflow_id, .. } => {
                            store.workflows.get(workflow_id).map(|w| w.status.clone())
                        }
                        DependencyKind::Wait { .. } => None,
                    },
                })
                .collect(),
            |d: &DependencyState| (d.dependency.created_at, d.dependency.id.clone()),
        );
        Ok(Some(WorkflowSnapshot {
            workflow,
            executions,
            dependencies,
        }))
    }

    async fn start_execution(&self, start: &StartExecution) -> SchedulerResult<()> {
        let mut store = self.lock()?;
        let execution = &start.execution;
        let workflow = store
            .workflows
            .get(&execution.workflow_id)
            .ok_or(SchedulerError::NotFound("workflow"))?;
        if workflow.status.is_terminal() {
            return Err(SchedulerError::Conflict("workflow is finished".into()));
        }
        if store.has_open_execution(&execution.workflow_id) {
            return Err(SchedulerError::Conflict(
                "workflow already has an open execution".into(),
            ));
        }
        let index_taken = store.workflow_executions.values().any(|e| {
            e.workflow_id == execution.workflow_id && e.execution_index >= execution.execution_index
        });
        if index_taken {
            return Err(SchedulerError::Conflict(format!(
                "execution index {} is not the next one",
                execution.execution_index
            )));
        }

        for child in &start.children {
            store.workflows.insert(child.id.clone(), child.clone());
        }
        for dependency in &start.dependencies {
            store
                .dependencies
                .insert(dependency.id.clone(), dependency.clone());
        }
        store
            .workflow_executions
            .insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn emit_step(&self, emission: &StepEmission, now: DateTime<Utc>) -> SchedulerResult<ScheduledJob> {
        let mut store = self.lock()?;
        let execution = store
            .workflow_executions
            .get(&emission.execution_id)
            .ok_or(SchedulerError::NotFound("workflow execution"))?;
        if execution.status != ExecutionStatus::Waiting {
            return Err(SchedulerError::Conflict(format!(
                "workflow execution {} is {}",
                execution.id,
                execution.status.as_str()
            )));
        }

        store.admit(&emission.job.tenant_id, 1, now)?;
        store
            .requests
            .insert(emission.request.id.clone(), emission.request.clone());
        let job = store.insert_job(&emission.job, now);
        if let Some(execution) = store.workflow_executions.get_mut(&emission.execution_id) {
            execution.status = ExecutionStatus::Scheduled;
            execution.scheduled_job_id = Some(job.id.clone());
        }
        if let Some(workflow) = store.workflows.get_mut(&emission.workflow_id) {
            workflow.context = emission.context.clone();
        }
        Ok(job)
    }

    async fn finalize_workflow(
        &self,
        workflow_id: &str,
        status: &WorkflowStatus,
        context: &Value,
        now: DateTime<Utc>,
    ) -> SchedulerResult<()> {
        if !status.is_terminal() {
            return Err(SchedulerError::validation("workflows can only finish as completed or failed"));
        }
        let mut store = self.lock()?;
        let workflow = store
            .workflows
            .get_mut(workflow_id)
            .ok_or(SchedulerError::NotFound("workflow"))?;
        if workflow.status.is_terminal() {
            return Err(SchedulerError::Conflict(format!(
                "workflow {} is already {}",
                workflow_id,
                workflow.status.as_str()
            )));
        }
        workflow.status = status.clone();
        workflow.context = context.clone();
        workflow.finished_at = Some(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn failing_store_surfaces_database_errors() {
        let db = MockDb::failing();
        let err = db.find_tenant("tenant_x").await.unwrap_err();
        assert!(matches!(err, SchedulerError::Database(_)));
    }

    #[tokio::test]
    async fn purge_unlinks_retries_of_purged_jobs() {
        let db = MockDb::default();
        let now = Utc.timestamp_opt(1_767_225_600, 0).unwrap();
        let new_job = |id: &str, retry_for: Option<&str>| NewScheduledJob {
            id: id.into(),
            hash: "h".into(),
            tenant_id: "tenant_1".into(),
            region: "eu".into(),
            request_id: "req_1".into(),
            scheduled_at: now,
            timeout_ms: None,
            max_retries: 0,
            max_response_bytes: None,
            attempt: 0,
            origin: JobOrigin::OneOff("oneoff_1".into()),
            retry_for_id: retry_for.map(str::to_string),
        };
        {
            let mut store = db.lock().unwrap();
            let mut first = store.insert_job(&new_job("job_1", None), now);
            first.deleted_at = Some(now);
            store.jobs.insert(first.id.clone(), first);
            store.insert_job(&new_job("job_2", Some("job_1")), now);
        }

        assert_eq!(db.purge_deleted(now + Duration::seconds(1)).await.unwrap(), 1);
        let survivor = db.find_job("job_2").await.unwrap().unwrap();
        assert_eq!(survivor.retry_for_id, None);
        assert_eq!(db.retry_chain("job_2").await.unwrap().len(), 1);
    }

    #[test]
    fn cron_occurrences_are_unique_but_retries_are_exempt() {
        let db = MockDb::default();
        let now = Utc.timestamp_opt(1_767_225_600, 0).unwrap();
        let occurrence = |id: &str, retry_for: Option<&str>| NewScheduledJob {
            id: id.into(),
            hash: id.into(),
            tenant_id: "tenant_1".into(),
            region: "eu".into(),
            request_id: "req_1".into(),
            scheduled_at: now,
            timeout_ms: None,
            max_retries: 1,
            max_response_bytes: None,
            attempt: 0,
            origin: JobOrigin::Cron("cron_1".into()),
            retry_for_id: retry_for.map(str::to_string),
        };
        let mut store = db.lock().unwrap();
        assert!(!store.occurrence_taken(&occurrence("job_1", None)));
        store.insert_job(&occurrence("job_1", None), now);

        assert!(store.occurrence_taken(&occurrence("job_2", None)));
        assert!(!store.occurrence_taken(&occurrence("job_3", Some("job_0"))));
    }
}
