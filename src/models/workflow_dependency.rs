use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::errors::SchedulerError;

/// A blocking condition: a child workflow or a timed wait, never both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DependencyKind {
    ChildWorkflow { workflow_id: String, name: String },
    Wait { name: String, until: DateTime<Utc> },
}

impl DependencyKind {
    pub fn name(&self) -> &str {
        match self {
            DependencyKind::ChildWorkflow { name, .. } => name,
            DependencyKind::Wait { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowDependency {
    pub id: String,
    pub workflow_execution_id: String,
    pub kind: DependencyKind,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct WorkflowDependencyRow {
    pub id: String,
    pub workflow_execution_id: String,
    pub child_workflow_id: Option<String>,
    pub child_workflow_name: Option<String>,
    pub wait_name: Option<String>,
    pub wait_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl WorkflowDependency {
    /// `(child_workflow_id, child_workflow_name, wait_name, wait_until)`
    pub fn columns(&self) -> (Option<&str>, Option<&str>, Option<&str>, Option<DateTime<Utc>>) {
        match &self.kind {
            DependencyKind::ChildWorkflow { workflow_id, name } => {
                (Some(workflow_id.as_str()), Some(name.as_str()), None, None)
            }
            DependencyKind::Wait { name, until } => (None, None, Some(name.as_str()), Some(*until)),
        }
    }
}

impl TryFrom<WorkflowDependencyRow> for WorkflowDependency {
    type Error = SchedulerError;

    fn try_from(row: WorkflowDependencyRow) -> Result<Self, Self::Error> {
        let kind = match (
            row.child_workflow_id,
            row.child_workflow_name,
            row.wait_name,
            row.wait_until,
        ) {
            (Some(workflow_id), Some(name), None, None) => {
                DependencyKind::ChildWorkflow { workflow_id, name }
            }
            (None, None, Some(name), Some(until)) => DependencyKind::Wait { name, until },
            _ => {
                return Err(SchedulerError::Corrupt(format!(
                    "dependency {} must be a child workflow or a wait",
                    row.id
                )))
            }
        };
        Ok(WorkflowDependency {
            id: row.id,
            workflow_execution_id: row.workflow_execution_id,
            kind,
            created_at: row.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> WorkflowDependencyRow {
        WorkflowDependencyRow {
            id: "wfdep_1".into(),
            workflow_execution_id: "wfexec_1".into(),
            child_workflow_id: None,
            child_workflow_name: None,
            wait_name: None,
            wait_until: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn child_and_wait_are_mutually_exclusive() {
        let mut both = row();
        both.child_workflow_id = Some("wf_2".into());
        both.child_workflow_name = Some("fetch".into());
        both.wait_name = Some("cooldown".into());
        both.wait_until = Some(Utc::now());
        assert!(WorkflowDependency::try_from(both).is_err());
        assert!(WorkflowDependency::try_from(row()).is_err());
    }

    #[test]
    fn names_mirror_their_identifiers() {
        let mut half = row();
        half.child_workflow_id = Some("wf_2".into());
        assert!(WorkflowDependency::try_from(half).is_err());

        let mut wait = row();
        wait.wait_name = Some("cooldown".into());
        wait.wait_until = Some(Utc::now());
        let dep = WorkflowDependency::try_from(wait).unwrap();
        assert_eq!(dep.kind.name(), "cooldown");
        let (child, child_name, wait_name, until) = dep.columns();
        assert!(child.is_none() && child_name.is_none());
        assert!(wait_name.is_some() && until.is_some());
    }
}
