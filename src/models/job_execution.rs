use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::errors::SchedulerError;

/// Either the captured response or the reason no response was obtained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Response(String),
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: String,
    pub job_id: String,
    pub drone_id: Option<String>,
    pub request_id: String,
    pub success: bool,
    pub outcome: ExecutionOutcome,
    pub executed_at: DateTime<Utc>,
}

impl JobExecution {
    pub fn new(
        id: String,
        job_id: String,
        drone_id: Option<String>,
        request_id: String,
        success: bool,
        outcome: ExecutionOutcome,
        executed_at: DateTime<Utc>,
    ) -> Result<Self, SchedulerError> {
        if success && matches!(outcome, ExecutionOutcome::Error(_)) {
            return Err(SchedulerError::validation(
                "an execution that produced no response cannot be successful",
            ));
        }
        Ok(Self {
            id,
            job_id,
            drone_id,
            request_id,
            success,
            outcome,
            executed_at,
        })
    }

    pub fn response_id(&self) -> Option<&str> {
        match &self.outcome {
            ExecutionOutcome::Response(id) => Some(id.as_str()),
            ExecutionOutcome::Error(_) => None,
        }
    }

    pub fn response_error(&self) -> Option<&str> {
        match &self.outcome {
            ExecutionOutcome::Error(e) => Some(e.as_str()),
            ExecutionOutcome::Response(_) => None,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct JobExecutionRow {
    pub id: String,
    pub job_id: String,
    pub drone_id: Option<String>,
    pub request_id: String,
    pub success: bool,
    pub response_id: Option<String>,
    pub response_error: Option<String>,
    pub executed_at: DateTime<Utc>,
}

impl TryFrom<JobExecutionRow> for JobExecution {
    type Error = SchedulerError;

    fn try_from(row: JobExecutionRow) -> Result<Self, Self::Error> {
        let outcome = match (row.response_id, row.response_error) {
            (Some(id), None) => ExecutionOutcome::Response(id),
            (None, Some(err)) => ExecutionOutcome::Error(err),
            _ => {
                return Err(SchedulerError::Corrupt(format!(
                    "execution {} must have exactly one of response or error",
                    row.id
                )))
            }
        };
        JobExecution::new(
            row.id,
            row.job_id,
            row.drone_id,
            row.request_id,
            row.success,
            outcome,
            row.executed_at,
        )
        .map_err(|e| SchedulerError::Corrupt(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(response_id: Option<&str>, response_error: Option<&str>) -> JobExecutionRow {
        JobExecutionRow {
            id: "exec_1".into(),
            job_id: "job_1".into(),
            drone_id: None,
            request_id: "req_1".into(),
            success: false,
            response_id: response_id.map(String::from),
            response_error: response_error.map(String::from),
            executed_at: Utc::now(),
        }
    }

    #[test]
    fn exactly_one_of_response_or_error() {
        assert!(JobExecution::try_from(row(Some("resp_1"), None)).is_ok());
        assert!(JobExecution::try_from(row(None, Some("timeout"))).is_ok());
        assert!(JobExecution::try_from(row(None, None)).is_err());
        assert!(JobExecution::try_from(row(Some("resp_1"), Some("timeout"))).is_err());
    }

    #[test]
    fn errors_are_never_successful() {
        let mut r = row(None, Some("dns failure"));
        r.success = true;
        assert!(matches!(
            JobExecution::try_from(r),
            Err(SchedulerError::Corrupt(_))
        ));
    }
}
