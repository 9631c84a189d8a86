use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::errors::SchedulerError;

/// What produced a scheduled job. Exactly one source per job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum JobOrigin {
    OneOff(String),
    Cron(String),
    WorkflowStep(String),
}

impl JobOrigin {
    pub fn from_columns(
        one_off_job_id: Option<String>,
        cron_job_id: Option<String>,
        workflow_execution_id: Option<String>,
    ) -> Result<Self, String> {
        match (one_off_job_id, cron_job_id, workflow_execution_id) {
            (Some(id), None, None) => Ok(JobOrigin::OneOff(id)),
            (None, Some(id), None) => Ok(JobOrigin::Cron(id)),
            (None, None, Some(id)) => Ok(JobOrigin::WorkflowStep(id)),
            _ => Err("job must have exactly one origin".into()),
        }
    }

    /// `(one_off_job_id, cron_job_id, workflow_execution_id)`
    pub fn columns(&self) -> (Option<&str>, Option<&str>, Option<&str>) {
        match self {
            JobOrigin::OneOff(id) => (Some(id.as_str()), None, None),
            JobOrigin::Cron(id) => (None, Some(id.as_str()), None),
            JobOrigin::WorkflowStep(id) => (None, None, Some(id.as_str())),
        }
    }

    pub fn workflow_execution_id(&self) -> Option<&str> {
        match self {
            JobOrigin::WorkflowStep(id) => Some(id.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub drone_id: String,
    pub leased_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: String,
    pub hash: String,
    pub tenant_id: String,
    pub region: String,
    pub request_id: String,
    pub scheduled_at: DateTime<Utc>,
    pub timeout_ms: Option<i32>,
    pub max_retries: i32,
    pub max_response_bytes: Option<i32>,
    pub attempt: i32,
    pub lock_nonce: i64,
    pub times_locked: i32,
    pub lease: Option<Lease>,
    pub origin: JobOrigin,
    pub retry_for_id: Option<String>,
    pub execution_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl ScheduledJob {
    pub fn is_executed(&self) -> bool {
        self.execution_id.is_some()
    }

    pub fn is_leaseable(&self, region: &str, now: DateTime<Utc>) -> bool {
        self.region == region
            && self.lease.is_none()
            && self.execution_id.is_none()
            && self.deleted_at.is_none()
            && self.scheduled_at <= now
    }

    /// Timeout the drone should apply, falling back to tenant/system limits.
    pub fn effective_timeout_ms(&self, default_timeout_ms: i32, tenant_max_timeout_ms: i32) -> i32 {
        self.timeout_ms
            .unwrap_or_else(|| default_timeout_ms.min(tenant_max_timeout_ms))
    }

    /// Moment after which the current lease may be reclaimed.
    pub fn lease_deadline(
        &self,
        default_timeout_ms: i32,
        tenant_max_timeout_ms: i32,
        grace: Duration,
    ) -> Option<DateTime<Utc>> {
        self.lease.as_ref().map(|lease| {
            lease.leased_at
                + Duration::milliseconds(
                    self.effective_timeout_ms(default_timeout_ms, tenant_max_timeout_ms) as i64,
                )
                + grace
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ScheduledJobRow {
    pub id: String,
    pub hash: String,
    pub tenant_id: String,
    pub region: String,
    pub request_id: String,
    pub scheduled_at: DateTime<Utc>,
    pub timeout_ms: Option<i32>,
    pub max_retries: i32,
    pub max_response_bytes: Option<i32>,
    pub attempt: i32,
    pub lock_nonce: i64,
    pub times_locked: i32,
    pub leased_by: Option<String>,
    pub leased_at: Option<DateTime<Utc>>,
    pub one_off_job_id: Option<String>,
    pub cron_job_id: Option<String>,
    pub workflow_execution_id: Option<String>,
    pub retry_for_id: Option<String>,
    pub execution_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl TryFrom<ScheduledJobRow> for ScheduledJob {
    type Error = SchedulerError;

    fn try_from(row: ScheduledJobRow) -> Result<Self, Self::Error> {
        let origin = JobOrigin::from_columns(
            row.one_off_job_id,
            row.cron_job_id,
            row.workflow_execution_id,
        )
        .map_err(|e| SchedulerError::Corrupt(format!("scheduled job {}: {}", row.id, e)))?;
        let lease = match (row.leased_by, row.leased_at) {
            (Some(drone_id), Some(leased_at)) => Some(Lease {
                drone_id,
                leased_at,
            }),
            (None, None) => None,
            _ => {
                return Err(SchedulerError::Corrupt(format!(
                    "scheduled job {}: half-populated lease",
                    row.id
                )))
            }
        };

        Ok(ScheduledJob {
            id: row.id,
            hash: row.hash,
            tenant_id: row.tenant_id,
            region: row.region,
            request_id: row.request_id,
            scheduled_at: row.scheduled_at,
            timeout_ms: row.timeout_ms,
            max_retries: row.max_retries,
            max_response_bytes: row.max_response_bytes,
            attempt: row.attempt,
            lock_nonce: row.lock_nonce,
            times_locked: row.times_locked,
            lease,
            origin,
            retry_for_id: row.retry_for_id,
            execution_id: row.execution_id,
            created_at: row.created_at,
            deleted_at: row.deleted_at,
        })
    }
}

/// A job about to be inserted. Nonce and lock counters always start at zero.
#[derive(Debug, Clone, PartialEq)]
pub struct NewScheduledJob {
    pub id: String,
    pub hash: String,
    pub tenant_id: String,
    pub region: String,
    pub request_id: String,
    pub scheduled_at: DateTime<Utc>,
    pub timeout_ms: Option<i32>,
    pub max_retries: i32,
    pub max_response_bytes: Option<i32>,
    pub attempt: i32,
    pub origin: JobOrigin,
    pub retry_for_id: Option<String>,
}

impl NewScheduledJob {
    pub fn into_job(self, now: DateTime<Utc>) -> ScheduledJob {
        ScheduledJob {
            id: self.id,
            hash: self.hash,
            tenant_id: self.tenant_id,
            region: self.region,
            request_id: self.request_id,
            scheduled_at: self.scheduled_at,
            timeout_ms: self.timeout_ms,
            max_retries: self.max_retries,
            max_response_bytes: self.max_response_bytes,
            attempt: self.attempt,
            lock_nonce: 0,
            times_locked: 0,
            lease: None,
            origin: self.origin,
            retry_for_id: self.retry_for_id,
            execution_id: None,
            created_at: now,
            deleted_at: None,
        }
    }
}
