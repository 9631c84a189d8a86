use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::errors::SchedulerResult;
use crate::models::http::HttpRequest;
use crate::models::scheduled_job::{NewScheduledJob, ScheduledJob};
use crate::models::workflow::{Workflow, WorkflowStatus};
use crate::models::workflow_dependency::WorkflowDependency;
use crate::models::workflow_execution::WorkflowExecution;

/// A dependency with the status of its child workflow, if it has one.
#[derive(Debug, Clone, PartialEq)]
pub struct DependencyState {
    pub dependency: WorkflowDependency,
    pub child_status: Option<WorkflowStatus>,
}

/// Everything the orchestrator needs to decide a workflow's next move.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowSnapshot {
    pub workflow: Workflow,
    /// Ordered by `execution_index`.
    pub executions: Vec<WorkflowExecution>,
    pub dependencies: Vec<DependencyState>,
}

#[derive(Debug, Clone)]
pub struct StartExecution {
    pub execution: WorkflowExecution,
    pub children: Vec<Workflow>,
    pub dependencies: Vec<WorkflowDependency>,
}

#[derive(Debug, Clone)]
pub struct StepEmission {
    pub workflow_id: String,
    pub execution_id: String,
    pub request: HttpRequest,
    pub job: NewScheduledJob,
    pub context: Value,
}

#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    async fn create_workflow(&self, workflow: &Workflow) -> SchedulerResult<()>;

    async fn find_workflow(&self, workflow_id: &str) -> SchedulerResult<Option<Workflow>>;

    async fn pending_workflow_ids(&self, limit: i64) -> SchedulerResult<Vec<String>>;

    async fn load_snapshot(&self, workflow_id: &str) -> SchedulerResult<Option<WorkflowSnapshot>>;

    /// Inserts a `waiting` execution with its children and dependencies.
    /// `Conflict` if the workflow already has a non-terminal execution.
    async fn start_execution(&self, start: &StartExecution) -> SchedulerResult<()>;

    /// Admits the tenant, inserts the step request and job and moves the
    /// execution `waiting -> scheduled`. `Conflict` if it is no longer waiting.
    async fn emit_step(
        &self,
        emission: &StepEmission,
        now: DateTime<Utc>,
    ) -> SchedulerResult<ScheduledJob>;

    /// `pending -> completed | failed`. `Conflict` if already terminal.
    async fn finalize_workflow(
        &self,
        workflow_id: &str,
        status: &WorkflowStatus,
        context: &Value,
        now: DateTime<Utc>,
    ) -> SchedulerResult<()>;
}
