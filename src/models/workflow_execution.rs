use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use std::str::FromStr;

use crate::errors::SchedulerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Waiting,
    Scheduled,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Waiting => "waiting",
            ExecutionStatus::Scheduled => "scheduled",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(ExecutionStatus::Waiting),
            "scheduled" => Ok(ExecutionStatus::Scheduled),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            other => Err(format!("unknown execution status {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: String,
    pub workflow_id: String,
    pub execution_index: i32,
    pub is_retry: bool,
    pub status: ExecutionStatus,
    pub scheduled_job_id: Option<String>,
    pub result_json: Option<Value>,
    pub failure_reason: Option<String>,
    pub executed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl WorkflowExecution {
    pub fn waiting(
        id: String,
        workflow_id: String,
        execution_index: i32,
        is_retry: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            workflow_id,
            execution_index,
            is_retry,
            status: ExecutionStatus::Waiting,
            scheduled_job_id: None,
            result_json: None,
            failure_reason: None,
            executed_at: None,
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct WorkflowExecutionRow {
    pub id: String,
    pub workflow_id: String,
    pub execution_index: i32,
    pub is_retry: bool,
    pub status: String,
    pub scheduled_job_id: Option<String>,
    pub result_json: Option<Value>,
    pub failure_reason: Option<String>,
    pub executed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<WorkflowExecutionRow> for WorkflowExecution {
    type Error = SchedulerError;

    fn try_from(row: WorkflowExecutionRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<ExecutionStatus>()
            .map_err(|e| SchedulerError::Corrupt(format!("workflow execution {}: {}", row.id, e)))?;
        Ok(WorkflowExecution {
            id: row.id,
            workflow_id: row.workflow_id,
            execution_index: row.execution_index,
            is_retry: row.is_retry,
            status,
            scheduled_job_id: row.scheduled_job_id,
            result_json: row.result_json,
            failure_reason: row.failure_reason,
            executed_at: row.executed_at,
            created_at: row.created_at,
        })
    }
}
