use chrono::{DateTime, Utc};

use crate::utils::encryption::EncryptionError;

/// Errors surfaced by the scheduling core and its repositories.
///
/// Execution failures reported by drones are not errors: they are recorded as
/// `ExecutionOutcome::Error` on the job execution and feed the retry chain.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("tenant {tenant_id} is rate limited until {retry_at}")]
    RateLimited {
        tenant_id: String,
        retry_at: DateTime<Utc>,
    },
    #[error("lease on job {job_id} is stale")]
    StaleLease { job_id: String },
    #[error("{0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    Conflict(String),
    #[error("drone {drone_id} is not eligible to lease in region {region}")]
    DroneNotEligible { drone_id: String, region: String },
    #[error("stored row violates an invariant: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Encryption(#[from] EncryptionError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

impl SchedulerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        SchedulerError::Validation(msg.into())
    }

    pub fn stale(job_id: impl Into<String>) -> Self {
        SchedulerError::StaleLease {
            job_id: job_id.into(),
        }
    }
}
