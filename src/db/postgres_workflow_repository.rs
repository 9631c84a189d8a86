use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgConnection, PgPool};

use super::conflict_on_unique;
use super::postgres_job_repository::{insert_job, insert_request};
use super::postgres_tenant_repository::admit_in_tx;
use super::workflow_repository::{
    DependencyState, StartExecution, StepEmission, WorkflowRepository, WorkflowSnapshot,
};
use crate::engine::orchestrator::StepOutcome;
use crate::errors::{SchedulerError, SchedulerResult};
use crate::models::scheduled_job::ScheduledJob;
use crate::models::workflow::{Workflow, WorkflowRow, WorkflowStatus};
use crate::models::workflow_dependency::{WorkflowDependency, WorkflowDependencyRow};
use crate::models::workflow_execution::{WorkflowExecution, WorkflowExecutionRow};

const WORKFLOW_COLUMNS: &str = "id, tenant_id, region, implementation_url, input, context, max_retries, \
     parent_workflow_id, status, result, error, created_at, finished_at";

const EXECUTION_COLUMNS: &str = "id, workflow_id, execution_index, is_retry, status, \
     scheduled_job_id, result_json, failure_reason, executed_at, created_at";

pub struct PostgresWorkflowRepository {
    pub pool: PgPool,
}

#[derive(FromRow)]
struct DependencyStateRow {
    #[sqlx(flatten)]
    dependency: WorkflowDependencyRow,
    child_status: Option<String>,
    child_result: Option<Value>,
    child_error: Option<String>,
}

impl TryFrom<DependencyStateRow> for DependencyState {
    type Error = SchedulerError;

    fn try_from(row: DependencyStateRow) -> Result<Self, Self::Error> {
        let dependency = WorkflowDependency::try_from(row.dependency)?;
        let child_status = row
            .child_status
            .map(|status| WorkflowStatus::from_columns(&status, row.child_result, row.child_error))
            .transpose()
            .map_err(|e| SchedulerError::Corrupt(format!("dependency {}: {}", dependency.id, e)))?;
        Ok(DependencyState {
            dependency,
            child_status,
        })
    }
}

/// Lands a step outcome on a `scheduled` workflow execution. `None` when the
/// execution already moved on.
pub(crate) async fn mark_step(
    conn: &mut PgConnection,
    execution_id: &str,
    outcome: &StepOutcome,
    executed_at: DateTime<Utc>,
) -> SchedulerResult<Option<WorkflowExecution>> {
    let sql = format!(
        r#"
        UPDATE workflow_executions
        SET status = $2, result_json = $3, failure_reason = $4, executed_at = $5
        WHERE id = $1 AND status = 'scheduled'
        RETURNING {}
        "#,
        EXECUTION_COLUMNS
    );
    sqlx::query_as::<_, WorkflowExecutionRow>(&sql)
        .bind(execution_id)
        .bind(outcome.status.as_str())
        .bind(&outcome.result_json)
        .bind(&outcome.failure_reason)
        .bind(executed_at)
        .fetch_optional(&mut *conn)
        .await?
        .map(WorkflowExecution::try_from)
        .transpose()
}

fn status_columns(status: &WorkflowStatus) -> (&'static str, Option<&Value>, Option<&str>) {
    (status.as_str(), status.result(), status.error())
}

async fn insert_workflow(conn: &mut PgConnection, workflow: &Workflow) -> SchedulerResult<()> {
    let (status, result, error) = status_columns(&workflow.status);
    sqlx::query(
        r#"
        INSERT INTO workflows (
            id, tenant_id, region, implementation_url, input, context, max_retries,
            parent_workflow_id, status, result, error, created_at, finished_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        "#,
    )
    .bind(&workflow.id)
    .bind(&workflow.tenant_id)
    .bind(&workflow.region)
    .bind(&workflow.implementation_url)
    .bind(&workflow.input)
    .bind(&workflow.context)
    .bind(workflow.max_retries)
    .bind(&workflow.parent_workflow_id)
    .bind(status)
    .bind(result)
    .bind(error)
    .bind(workflow.created_at)
    .bind(workflow.finished_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| conflict_on_unique(e, "workflow"))?;
    Ok(())
}

#[async_trait]
impl WorkflowRepository for PostgresWorkflowRepository {
    async fn create_workflow(&self, workflow: &Workflow) -> SchedulerResult<()> {
        let mut conn = self.pool.acquire().await?;
        insert_workflow(&mut conn, workflow).await
    }

    async fn find_workflow(&self, workflow_id: &str) -> SchedulerResult<Option<Workflow>> {
        let sql = format!("SELECT {} FROM workflows WHERE id = $1", WORKFLOW_COLUMNS);
        sqlx::query_as::<_, WorkflowRow>(&sql)
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Workflow::try_from)
            .transpose()
    }

    async fn pending_workflow_ids(&self, limit: i64) -> SchedulerResult<Vec<String>> {
        Ok(sqlx::query_scalar(
            "SELECT id FROM workflows WHERE status = 'pending' ORDER BY created_at, id LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn load_snapshot(&self, workflow_id: &str) -> SchedulerResult<Option<WorkflowSnapshot>> {
        let mut tx = self.pool.begin().await?;
        let sql = format!("SELECT {} FROM workflows WHERE id = $1", WORKFLOW_COLUMNS);
        let Some(row) = sqlx::query_as::<_, WorkflowRow>(&sql)
            .bind(workflow_id)
            .fetch_optional(&mut *tx)
            .await?
        else {
            return Ok(None);
        };
        let workflow = Workflow::try_from(row)?;

        let sql = format!(
            "SELECT {} FROM workflow_executions WHERE workflow_id = $1 ORDER BY execution_index",
            EXECUTION_COLUMNS
        );
        let executions = sqlx::query_as::<_, WorkflowExecutionRow>(&sql)
            .bind(workflow_id)
            .fetch_all(&mut *tx)
            .await?
            .into_iter()
            .map(WorkflowExecution::try_from)
            .collect::<SchedulerResult<Vec<_>>>()?;

        let dependencies = sqlx::query_as::<_, DependencyStateRow>(
            r#"
            SELECT d.id, d.workflow_execution_id, d.child_workflow_id, d.child_workflow_name,
                   d.wait_name, d.wait_until, d.created_at,
                   c.status AS child_status, c.result AS child_result, c.error AS child_error
            FROM workflow_dependencies d
            JOIN workflow_executions e ON e.id = d.workflow_execution_id
            LEFT JOIN workflows c ON c.id = d.child_workflow_id
            WHERE e.workflow_id = $1
            ORDER BY d.created_at, d.id
            "#,
        )
        .bind(workflow_id)
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .map(DependencyState::try_from)
        .collect::<SchedulerResult<Vec<_>>>()?;
        tx.commit().await?;

        Ok(Some(WorkflowSnapshot {
            workflow,
            executions,
            dependencies,
        }))
    }

    async fn start_execution(&self, start: &StartExecution) -> SchedulerResult<()> {
        let execution = &start.execution;
        let mut tx = self.pool.begin().await?;

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM workflows WHERE id = $1 FOR UPDATE")
                .bind(&execution.workflow_id)
                .fetch_optional(&mut *tx)
                .await?;
        match status.as_deref() {
            None => return Err(SchedulerError::NotFound("workflow")),
            Some("pending") => {}
            Some(_) => return Err(SchedulerError::Conflict("workflow is finished".into())),
        }

        let (open, last_index): (bool, Option<i32>) = sqlx::query_as(
            r#"
            SELECT COALESCE(bool_or(status IN ('waiting', 'scheduled')), false), MAX(execution_index)
            FROM workflow_executions
            WHERE workflow_id = $1
            "#,
        )
        .bind(&execution.workflow_id)
        .fetch_one(&mut *tx)
        .await?;
        if open {
            return Err(SchedulerError::Conflict(
                "workflow already has an open execution".into(),
            ));
        }
        if last_index.map_or(false, |last| last >= execution.execution_index) {
            return Err(SchedulerError::Conflict(format!(
                "execution index {} is not the next one",
                execution.execution_index
            )));
        }

        for child in &start.children {
            insert_workflow(&mut tx, child).await?;
        }
        sqlx::query(
            r#"
            INSERT INTO workflow_executions (id, workflow_id, execution_index, is_retry, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&execution.id)
        .bind(&execution.workflow_id)
        .bind(execution.execution_index)
        .bind(execution.is_retry)
        .bind(execution.status.as_str())
        .bind(execution.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| conflict_on_unique(e, "workflow execution"))?;

        for dependency in &start.dependencies {
            let (child_id, child_name, wait_name, wait_until) = dependency.columns();
            sqlx::query(
                r#"
                INSERT INTO workflow_dependencies (
                    id, workflow_execution_id, child_workflow_id, child_workflow_name,
                    wait_name, wait_until, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(&dependency.id)
            .bind(&dependency.workflow_execution_id)
            .bind(child_id)
            .bind(child_name)
            .bind(wait_name)
            .bind(wait_until)
            .bind(dependency.created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn emit_step(&self, emission: &StepEmission, now: DateTime<Utc>) -> SchedulerResult<ScheduledJob> {
        let mut tx = self.pool.begin().await?;
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM workflow_executions WHERE id = $1 FOR UPDATE")
                .bind(&emission.execution_id)
                .fetch_optional(&mut *tx)
                .await?;
        match status.as_deref() {
            None => return Err(SchedulerError::NotFound("workflow execution")),
            Some("waiting") => {}
            Some(other) => {
                return Err(SchedulerError::Conflict(format!(
                    "workflow execution {} is {}",
                    emission.execution_id, other
                )))
            }
        }

        admit_in_tx(&mut tx, &emission.job.tenant_id, 1, now).await?;
        insert_request(&mut tx, &emission.request).await?;
        let job = insert_job(&mut tx, &emission.job, now).await?;
        sqlx::query(
            "UPDATE workflow_executions SET status = 'scheduled', scheduled_job_id = $2 WHERE id = $1",
        )
        .bind(&emission.execution_id)
        .bind(&job.id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE workflows SET context = $2 WHERE id = $1")
            .bind(&emission.workflow_id)
            .bind(&emission.context)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
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
            return Err(SchedulerError::validation(
                "workflows can only finish as completed or failed",
            ));
        }
        let (status, result, error) = status_columns(status);
        let updated = sqlx::query(
            r#"
            UPDATE workflows
            SET status = $2, result = $3, error = $4, context = $5, finished_at = $6
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(workflow_id)
        .bind(status)
        .bind(result)
        .bind(error)
        .bind(context)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 1 {
            return Ok(());
        }

        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM workflows WHERE id = $1)")
            .bind(workflow_id)
            .fetch_one(&self.pool)
            .await?;
        if exists {
            Err(SchedulerError::Conflict(format!(
                "workflow {} is already finished",
                workflow_id
            )))
        } else {
            Err(SchedulerError::NotFound("workflow"))
        }
    }
}
