use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

use crate::errors::SchedulerError;

/// `pending -> completed | failed`. The result or error lives on the terminal variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Completed { result: Value },
    Failed { error: String },
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Completed { .. } => "completed",
            WorkflowStatus::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkflowStatus::Pending)
    }

    pub fn result(&self) -> Option<&Value> {
        match self {
            WorkflowStatus::Completed { result } => Some(result),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            WorkflowStatus::Failed { error } => Some(error.as_str()),
            _ => None,
        }
    }

    pub fn from_columns(
        status: &str,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<Self, String> {
        match (status, result, error) {
            ("pending", None, None) => Ok(WorkflowStatus::Pending),
            ("completed", Some(result), None) => Ok(WorkflowStatus::Completed { result }),
            ("failed", None, Some(error)) => Ok(WorkflowStatus::Failed { error }),
            (status, _, _) => Err(format!("inconsistent columns for status {}", status)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub tenant_id: String,
    pub region: String,
    pub implementation_url: String,
    pub input: Value,
    pub context: Value,
    pub max_retries: i32,
    pub parent_workflow_id: Option<String>,
    #[serde(flatten)]
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow)]
pub struct WorkflowRow {
    pub id: String,
    pub tenant_id: String,
    pub region: String,
    pub implementation_url: String,
    pub input: Value,
    pub context: Value,
    pub max_retries: i32,
    pub parent_workflow_id: Option<String>,
    pub status: String,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<WorkflowRow> for Workflow {
    type Error = SchedulerError;

    fn try_from(row: WorkflowRow) -> Result<Self, Self::Error> {
        let status = WorkflowStatus::from_columns(&row.status, row.result, row.error)
            .map_err(|e| SchedulerError::Corrupt(format!("workflow {}: {}", row.id, e)))?;
        Ok(Workflow {
            id: row.id,
            tenant_id: row.tenant_id,
            region: row.region,
            implementation_url: row.implementation_url,
            input: row.input,
            context: row.context,
            max_retries: row.max_retries,
            parent_workflow_id: row.parent_workflow_id,
            status,
            created_at: row.created_at,
            finished_at: row.finished_at,
        })
    }
}

/// Tenant payload for `POST /api/workflows`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWorkflow {
    pub region: String,
    pub implementation_url: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub context: Option<Value>,
    #[serde(default)]
    pub max_retries: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn result_only_with_completed_and_error_only_with_failed() {
        assert_eq!(
            WorkflowStatus::from_columns("completed", Some(json!(1)), None),
            Ok(WorkflowStatus::Completed { result: json!(1) })
        );
        assert!(WorkflowStatus::from_columns("completed", None, None).is_err());
        assert!(WorkflowStatus::from_columns("pending", None, Some("x".into())).is_err());
        assert!(WorkflowStatus::from_columns("failed", Some(json!(1)), Some("x".into())).is_err());
        assert!(WorkflowStatus::from_columns("running", None, None).is_err());
    }
}
