pub mod cron_repository;
pub mod drone_repository;
pub mod job_repository;
pub mod mock_db;
pub mod postgres_cron_repository;
pub mod postgres_drone_repository;
pub mod postgres_job_repository;
pub mod postgres_secret_repository;
pub mod postgres_tenant_repository;
pub mod postgres_workflow_repository;
pub mod secret_repository;
pub mod tenant_repository;
pub mod workflow_repository;

use crate::errors::SchedulerError;

/// Maps a unique-constraint violation to `Conflict`, anything else to a database error.
pub(crate) fn conflict_on_unique(err: sqlx::Error, what: &str) -> SchedulerError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            SchedulerError::Conflict(format!("{} already exists", what))
        }
        _ => err.into(),
    }
}
