//! Workflow state machine.
//!
//! A workflow is driven by repeatedly POSTing its context to the
//! implementation URL. Each call is one [`WorkflowExecution`]; the JSON the
//! implementation returns can record step results, request child workflows
//! and timed waits, finish the workflow with a `result`, or fail with an
//! `error`. The orchestrator only ever looks at stored state: [`plan`] turns
//! a snapshot into the next move and [`tick_workflow`] applies it.

use chrono::serde::ts_seconds;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use crate::db::workflow_repository::{DependencyState, StartExecution, StepEmission, WorkflowSnapshot};
use crate::engine::fingerprint::{job_fingerprint, FingerprintParams};
use crate::engine::lease::ReportedResult;
use crate::errors::{SchedulerError, SchedulerResult};
use crate::models::http::{validate_url, NewHttpRequest};
use crate::models::scheduled_job::{JobOrigin, NewScheduledJob};
use crate::models::workflow::{Workflow, WorkflowStatus};
use crate::models::workflow_dependency::{DependencyKind, WorkflowDependency};
use crate::models::workflow_execution::{ExecutionStatus, WorkflowExecution};
use crate::state::AppState;
use crate::utils::id::{new_id, DEPENDENCY, JOB, REQUEST, WORKFLOW, WORKFLOW_EXECUTION};

/// Upper bound on transitions applied by one tick of one workflow.
const MAX_TRANSITIONS: usize = 4;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum WaitDefinition {
    Struct {
        #[serde(with = "ts_seconds")]
        wait_until: DateTime<Utc>,
    },
    Timestamp(#[serde(with = "ts_seconds")] DateTime<Utc>),
}

impl WaitDefinition {
    pub fn wait_until(&self) -> DateTime<Utc> {
        match self {
            WaitDefinition::Struct { wait_until } | WaitDefinition::Timestamp(wait_until) => *wait_until,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ChildDefinition {
    Struct {
        url: String,
        input: Value,
        #[serde(default)]
        max_retries: Option<i32>,
    },
    Tuple(String, Value),
}

impl ChildDefinition {
    pub fn url(&self) -> &str {
        match self {
            ChildDefinition::Struct { url, .. } | ChildDefinition::Tuple(url, _) => url,
        }
    }

    pub fn input(&self) -> &Value {
        match self {
            ChildDefinition::Struct { input, .. } | ChildDefinition::Tuple(_, input) => input,
        }
    }

    pub fn max_retries(&self) -> Option<i32> {
        match self {
            ChildDefinition::Struct { max_retries, .. } => *max_retries,
            ChildDefinition::Tuple(..) => None,
        }
    }
}

/// JSON body an implementation returns from a step.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StepReturn {
    #[serde(default)]
    pub new_steps: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    pub new_children: Option<BTreeMap<String, ChildDefinition>>,
    #[serde(default)]
    pub new_waits: Option<BTreeMap<String, WaitDefinition>>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl StepReturn {
    fn parse(value: &Value) -> Option<Self> {
        match value {
            Value::Object(_) => serde_json::from_value(value.clone()).ok(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChildWorkflowResult {
    Success { data: Value },
    Failure { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreviousError {
    #[serde(with = "ts_seconds")]
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Body sent to the implementation on every step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowContext {
    pub input: Value,
    pub steps: BTreeMap<String, Value>,
    pub child_workflows: BTreeMap<String, ChildWorkflowResult>,
    pub completed_waits: BTreeSet<String>,
    pub prev_errors: Vec<PreviousError>,
}

impl WorkflowContext {
    pub fn new(input: Value) -> Self {
        Self {
            input,
            steps: BTreeMap::new(),
            child_workflows: BTreeMap::new(),
            completed_waits: BTreeSet::new(),
            prev_errors: Vec::new(),
        }
    }

    pub fn from_snapshot(snapshot: &WorkflowSnapshot, now: DateTime<Utc>) -> Self {
        let mut context = Self::new(snapshot.workflow.input.clone());
        for execution in &snapshot.executions {
            context.ingest_execution(execution);
        }
        for state in &snapshot.dependencies {
            match (&state.dependency.kind, &state.child_status) {
                (DependencyKind::Wait { name, until }, _) if *until <= now => {
                    context.completed_waits.insert(name.clone());
                }
                (DependencyKind::ChildWorkflow { name, .. }, Some(WorkflowStatus::Completed { result })) => {
                    context.child_workflows.insert(
                        name.clone(),
                        ChildWorkflowResult::Success { data: result.clone() },
                    );
                }
                (DependencyKind::ChildWorkflow { name, .. }, Some(WorkflowStatus::Failed { error })) => {
                    context.child_workflows.insert(
                        name.clone(),
                        ChildWorkflowResult::Failure { error: error.clone() },
                    );
                }
                _ => {}
            }
        }
        context
    }

    fn ingest_execution(&mut self, execution: &WorkflowExecution) {
        let executed_at = execution.executed_at.unwrap_or(execution.created_at);
        if let Some(reason) = &execution.failure_reason {
            self.prev_errors.push(PreviousError {
                timestamp: executed_at,
                message: reason.clone(),
            });
            return;
        }
        if let Some(returned) = execution.result_json.as_ref().and_then(StepReturn::parse) {
            self.steps.extend(returned.new_steps.unwrap_or_default());
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({ "input": self.input }))
    }
}

/// How a reported step response lands on its execution.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub status: ExecutionStatus,
    pub result_json: Option<Value>,
    pub failure_reason: Option<String>,
}

impl StepOutcome {
    fn failed(reason: String, json: Option<Value>) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            result_json: json,
            failure_reason: Some(reason),
        }
    }
}

/// Classifies a drone report for a workflow step job.
pub fn step_outcome(result: &ReportedResult) -> StepOutcome {
    let response = match result {
        ReportedResult::Error(error) => return StepOutcome::failed(error.clone(), None),
        ReportedResult::Response(response) => response,
    };

    let json: Value = match serde_json::from_str(&response.body) {
        Ok(json) => json,
        Err(e) => {
            return StepOutcome::failed(
                format!("step response is not json ({}): {}", e, response.body),
                None,
            )
        }
    };
    if !response.is_success() {
        return StepOutcome::failed(
            format!("step responded with status {}", response.status),
            Some(json),
        );
    }
    let Some(returned) = StepReturn::parse(&json) else {
        return StepOutcome::failed(
            "step response does not match the expected format".into(),
            Some(json),
        );
    };
    if let Some(error) = &returned.error {
        return StepOutcome::failed(format!("implementation returned an error: {:?}", error), Some(json));
    }
    for (name, child) in returned.new_children.iter().flatten() {
        if let Err(e) = validate_url(child.url()) {
            return StepOutcome::failed(format!("child workflow {}: {}", name, e), Some(json));
        }
    }

    StepOutcome {
        status: ExecutionStatus::Completed,
        result_json: Some(json),
        failure_reason: None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowDecision {
    StartExecution {
        execution_index: i32,
        is_retry: bool,
        children: Vec<(String, ChildDefinition)>,
        waits: Vec<(String, DateTime<Utc>)>,
    },
    EmitStep {
        execution_id: String,
        scheduled_at: DateTime<Utc>,
    },
    /// Dependencies of the waiting execution are not all resolved yet.
    Waiting {
        execution_id: String,
        unresolved: Vec<String>,
    },
    InFlight {
        execution_id: String,
    },
    Complete {
        result: Value,
    },
    Fail {
        error: String,
    },
    Finished,
}

fn is_resolved(state: &DependencyState, now: DateTime<Utc>) -> bool {
    match &state.dependency.kind {
        DependencyKind::Wait { until, .. } => *until <= now,
        DependencyKind::ChildWorkflow { .. } => state
            .child_status
            .as_ref()
            .map(WorkflowStatus::is_terminal)
            .unwrap_or(false),
    }
}

/// Delay before the n-th retry (1-based) is emitted.
pub fn retry_delay(base: Duration, retries: i32) -> Duration {
    if retries <= 0 {
        return Duration::zero();
    }
    base * 2i32.saturating_pow((retries - 1).min(20) as u32)
}

/// Decides the next transition for a workflow from stored state alone.
pub fn plan(snapshot: &WorkflowSnapshot, retry_base: Duration, now: DateTime<Utc>) -> WorkflowDecision {
    let workflow = &snapshot.workflow;
    if workflow.status.is_terminal() {
        return WorkflowDecision::Finished;
    }
    let retries = snapshot.executions.iter().filter(|e| e.is_retry).count() as i32;

    let Some(latest) = snapshot.executions.last() else {
        return WorkflowDecision::StartExecution {
            execution_index: 0,
            is_retry: false,
            children: Vec::new(),
            waits: Vec::new(),
        };
    };
    let next_index = latest.execution_index + 1;

    match latest.status {
        ExecutionStatus::Waiting => {
            let unresolved: Vec<String> = snapshot
                .dependencies
                .iter()
                .filter(|d| d.dependency.workflow_execution_id == latest.id)
                .filter(|d| !is_resolved(d, now))
                .map(|d| d.dependency.kind.name().to_string())
                .collect();
            if !unresolved.is_empty() {
                return WorkflowDecision::Waiting {
                    execution_id: latest.id.clone(),
                    unresolved,
                };
            }
            let delay = if latest.is_retry {
                retry_delay(retry_base, retries)
            } else {
                Duration::zero()
            };
            WorkflowDecision::EmitStep {
                execution_id: latest.id.clone(),
                scheduled_at: now + delay,
            }
        }
        ExecutionStatus::Scheduled => WorkflowDecision::InFlight {
            execution_id: latest.id.clone(),
        },
        ExecutionStatus::Failed => {
            if retries >= workflow.max_retries {
                WorkflowDecision::Fail {
                    error: latest
                        .failure_reason
                        .clone()
                        .unwrap_or_else(|| "step failed".into()),
                }
            } else {
                WorkflowDecision::StartExecution {
                    execution_index: next_index,
                    is_retry: true,
                    children: Vec::new(),
                    waits: Vec::new(),
                }
            }
        }
        ExecutionStatus::Completed => {
            let returned = latest
                .result_json
                .as_ref()
                .and_then(StepReturn::parse)
                .unwrap_or_default();
            if let Some(result) = returned.result {
                return WorkflowDecision::Complete { result };
            }

            let existing: BTreeSet<&str> = snapshot
                .dependencies
                .iter()
                .map(|d| d.dependency.kind.name())
                .collect();
            let children: Vec<(String, ChildDefinition)> = returned
                .new_children
                .unwrap_or_default()
                .into_iter()
                .filter(|(name, _)| !existing.contains(name.as_str()))
                .collect();
            let waits: Vec<(String, DateTime<Utc>)> = returned
                .new_waits
                .unwrap_or_default()
                .into_iter()
                .filter(|(name, _)| !existing.contains(name.as_str()))
                .map(|(name, wait)| (name, wait.wait_until()))
                .collect();

            let earlier_steps: BTreeSet<String> = snapshot.executions[..snapshot.executions.len() - 1]
                .iter()
                .filter_map(|e| e.result_json.as_ref().and_then(StepReturn::parse))
                .flat_map(|r| r.new_steps.unwrap_or_default().into_keys())
                .collect();
            let new_steps = returned
                .new_steps
                .unwrap_or_default()
                .into_keys()
                .any(|name| !earlier_steps.contains(&name));

            let progressed = new_steps || !children.is_empty() || !waits.is_empty();
            if !progressed && retries >= workflow.max_retries {
                return WorkflowDecision::Fail {
                    error: format!(
                        "step made no progress and retries are exhausted after {} attempts",
                        workflow.max_retries
                    ),
                };
            }
            WorkflowDecision::StartExecution {
                execution_index: next_index,
                is_retry: !progressed,
                children,
                waits,
            }
        }
    }
}

fn start_execution_rows(
    state: &AppState,
    workflow: &Workflow,
    execution_index: i32,
    is_retry: bool,
    children: &[(String, ChildDefinition)],
    waits: &[(String, DateTime<Utc>)],
    now: DateTime<Utc>,
) -> StartExecution {
    let execution = WorkflowExecution::waiting(
        new_id(WORKFLOW_EXECUTION),
        workflow.id.clone(),
        execution_index,
        is_retry,
        now,
    );

    let mut child_rows = Vec::with_capacity(children.len());
    let mut dependencies = Vec::with_capacity(children.len() + waits.len());
    for (name, child) in children {
        let child_workflow = Workflow {
            id: new_id(WORKFLOW),
            tenant_id: workflow.tenant_id.clone(),
            region: workflow.region.clone(),
            implementation_url: child.url().to_string(),
            input: child.input().clone(),
            context: WorkflowContext::new(child.input().clone()).to_value(),
            max_retries: child
                .max_retries()
                .unwrap_or(state.settings().default_child_max_retries)
                .max(0),
            parent_workflow_id: Some(workflow.id.clone()),
            status: WorkflowStatus::Pending,
            created_at: now,
            finished_at: None,
        };
        dependencies.push(WorkflowDependency {
            id: new_id(DEPENDENCY),
            workflow_execution_id: execution.id.clone(),
            kind: DependencyKind::ChildWorkflow {
                workflow_id: child_workflow.id.clone(),
                name: name.clone(),
            },
            created_at: now,
        });
        child_rows.push(child_workflow);
    }
    for (name, until) in waits {
        dependencies.push(WorkflowDependency {
            id: new_id(DEPENDENCY),
            workflow_execution_id: execution.id.clone(),
            kind: DependencyKind::Wait {
                name: name.clone(),
                until: *until,
            },
            created_at: now,
        });
    }

    StartExecution {
        execution,
        children: child_rows,
        dependencies,
    }
}

fn step_emission(
    workflow: &Workflow,
    execution_id: &str,
    context: Value,
    scheduled_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> StepEmission {
    let request = NewHttpRequest {
        method: "POST".into(),
        url: workflow.implementation_url.clone(),
        headers: vec!["Content-Type: application/json".into()],
        body: Some(context.to_string()),
    }
    .into_request(new_id(REQUEST), now);

    let hash = job_fingerprint(
        &request,
        &FingerprintParams {
            tenant_id: &workflow.tenant_id,
            region: &workflow.region,
            scheduled_at: Some(scheduled_at),
            timeout_ms: None,
            max_retries: 0,
            max_response_bytes: None,
        },
    );
    let job = NewScheduledJob {
        id: new_id(JOB),
        hash,
        tenant_id: workflow.tenant_id.clone(),
        region: workflow.region.clone(),
        request_id: request.id.clone(),
        scheduled_at,
        timeout_ms: None,
        max_retries: 0,
        max_response_bytes: None,
        attempt: 0,
        origin: JobOrigin::WorkflowStep(execution_id.to_string()),
        retry_for_id: None,
    };

    StepEmission {
        workflow_id: workflow.id.clone(),
        execution_id: execution_id.to_string(),
        request,
        job,
        context,
    }
}

/// Applies transitions to one workflow until it has to wait on something
/// outside the orchestrator. Returns the last decision taken.
pub async fn tick_workflow(
    state: &AppState,
    workflow_id: &str,
    now: DateTime<Utc>,
) -> SchedulerResult<WorkflowDecision> {
    let mut decision = WorkflowDecision::Finished;
    for _ in 0..MAX_TRANSITIONS {
        let snapshot = state
            .workflows
            .load_snapshot(workflow_id)
            .await?
            .ok_or(SchedulerError::NotFound("workflow"))?;
        let workflow = &snapshot.workflow;
        decision = plan(&snapshot, state.settings().workflow_retry_base, now);

        match &decision {
            WorkflowDecision::StartExecution {
                execution_index,
                is_retry,
                children,
                waits,
            } => {
                let start = start_execution_rows(
                    state,
                    workflow,
                    *execution_index,
                    *is_retry,
                    children,
                    waits,
                    now,
                );
                match state.workflows.start_execution(&start).await {
                    Ok(()) => debug!(
                        workflow_id = %workflow.id,
                        execution_id = %start.execution.id,
                        children = start.children.len(),
                        "workflow execution started"
                    ),
                    Err(SchedulerError::Conflict(_)) => return Ok(decision),
                    Err(e) => return Err(e),
                }
            }
            WorkflowDecision::EmitStep {
                execution_id,
                scheduled_at,
            } => {
                let context = WorkflowContext::from_snapshot(&snapshot, now).to_value();
                let emission = step_emission(workflow, execution_id, context, *scheduled_at, now);
                return match state.workflows.emit_step(&emission, now).await {
                    Ok(job) => {
                        info!(
                            workflow_id = %workflow.id,
                            execution_id = %execution_id,
                            job_id = %job.id,
                            "workflow step scheduled"
                        );
                        Ok(decision)
                    }
                    Err(SchedulerError::RateLimited { retry_at, .. }) => {
                        debug!(workflow_id = %workflow.id, retry_at = %retry_at, "workflow step rate limited");
                        Ok(WorkflowDecision::Waiting {
                            execution_id: execution_id.clone(),
                            unresolved: Vec::new(),
                        })
                    }
                    Err(SchedulerError::Conflict(_)) => Ok(decision),
                    Err(e) => Err(e),
                };
            }
            WorkflowDecision::Complete { result } => {
                let context = WorkflowContext::from_snapshot(&snapshot, now).to_value();
                let status = WorkflowStatus::Completed {
                    result: result.clone(),
                };
                finalize(state, workflow, &status, &context, now).await?;
                return Ok(decision);
            }
            WorkflowDecision::Fail { error } => {
                let context = WorkflowContext::from_snapshot(&snapshot, now).to_value();
                let status = WorkflowStatus::Failed {
                    error: error.clone(),
                };
                finalize(state, workflow, &status, &context, now).await?;
                return Ok(decision);
            }
            WorkflowDecision::Waiting { .. }
            | WorkflowDecision::InFlight { .. }
            | WorkflowDecision::Finished => return Ok(decision),
        }
    }
    Ok(decision)
}

async fn finalize(
    state: &AppState,
    workflow: &Workflow,
    status: &WorkflowStatus,
    context: &Value,
    now: DateTime<Utc>,
) -> SchedulerResult<()> {
    match state
        .workflows
        .finalize_workflow(&workflow.id, status, context, now)
        .await
    {
        Ok(()) => {
            info!(workflow_id = %workflow.id, status = status.as_str(), "workflow finished");
            Ok(())
        }
        Err(SchedulerError::Conflict(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

/// One orchestrator pass over pending workflows. Returns how many were ticked.
pub async fn tick_all(state: &AppState, now: DateTime<Utc>, limit: i64) -> SchedulerResult<usize> {
    let ids = state.workflows.pending_workflow_ids(limit).await?;
    let count = ids.len();
    for id in ids {
        if let Err(e) = tick_workflow(state, &id, now).await {
            warn!(workflow_id = %id, error = %e, "workflow tick failed");
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::engine::lease::{self, ExecutionReport, LeasedJob};
    use crate::engine::submission;
    use crate::models::http::NewHttpResponse;
    use crate::models::workflow::NewWorkflow;
    use crate::state::test_support::{harness, TestHarness};

    fn response(status: i32, body: Value) -> ReportedResult {
        ReportedResult::Response(NewHttpResponse {
            status,
            headers: vec![],
            body: body.to_string(),
        })
    }

    async fn workflow(h: &TestHarness, tenant_id: &str, max_retries: i32) -> Workflow {
        submission::create_workflow(
            &h.state,
            tenant_id,
            NewWorkflow {
                region: "eu".into(),
                implementation_url: "https://impl.test/run".into(),
                input: json!({ "order": 7 }),
                context: None,
                max_retries: Some(max_retries),
            },
            h.clock.now(),
        )
        .await
        .unwrap()
    }

    async fn lease_step(h: &TestHarness) -> LeasedJob {
        h.drone("drone_a", "eu").await;
        lease::lease_next(&h.state, "drone_a", "eu", h.clock.now())
            .await
            .unwrap()
            .expect("a step job")
    }

    async fn answer(h: &TestHarness, job: &LeasedJob, result: ReportedResult) {
        lease::report(
            &h.state,
            &ExecutionReport {
                job_id: job.job_id.clone(),
                lock_nonce: job.lock_nonce,
                drone_id: "drone_a".into(),
                executed_at: h.clock.now(),
                result,
            },
        )
        .await
        .unwrap();
    }

    fn body(job: &LeasedJob) -> Value {
        serde_json::from_str(job.request.body.as_deref().unwrap()).unwrap()
    }

    #[test]
    fn step_outcome_classifies_responses() {
        let ok = step_outcome(&response(200, json!({ "new_steps": { "a": 1 } })));
        assert_eq!(ok.status, ExecutionStatus::Completed);
        assert!(ok.failure_reason.is_none());

        let transport = step_outcome(&ReportedResult::Error("timeout".into()));
        assert_eq!(transport.status, ExecutionStatus::Failed);
        assert!(transport.result_json.is_none());

        let not_json = step_outcome(&ReportedResult::Response(NewHttpResponse {
            status: 200,
            headers: vec![],
            body: "<html>".into(),
        }));
        assert_eq!(not_json.status, ExecutionStatus::Failed);
        assert!(not_json.result_json.is_none());

        let server_error = step_outcome(&response(500, json!({ "oops": true })));
        assert_eq!(server_error.status, ExecutionStatus::Failed);
        assert_eq!(server_error.result_json, Some(json!({ "oops": true })));

        let shape = step_outcome(&response(200, json!({ "new_steps": [1, 2] })));
        assert_eq!(shape.status, ExecutionStatus::Failed);
        assert!(shape.result_json.is_some());

        let errored = step_outcome(&response(200, json!({ "error": "card declined" })));
        assert_eq!(errored.status, ExecutionStatus::Failed);
        assert!(errored.failure_reason.unwrap().contains("card declined"));

        let bad_child = step_outcome(&response(
            200,
            json!({ "new_children": { "c": { "url": "ftp://x", "input": null } } }),
        ));
        assert_eq!(bad_child.status, ExecutionStatus::Failed);
    }

    #[test]
    fn child_and_wait_definitions_accept_both_forms() {
        let returned: StepReturn = serde_json::from_value(json!({
            "new_children": {
                "a": { "url": "https://a.test", "input": 1, "max_retries": 2 },
                "b": ["https://b.test", { "x": 1 }]
            },
            "new_waits": { "w1": { "wait_until": 1_767_225_900 }, "w2": 1_767_225_960 }
        }))
        .unwrap();
        let children = returned.new_children.unwrap();
        assert_eq!(children["a"].max_retries(), Some(2));
        assert_eq!(children["b"].url(), "https://b.test");
        let waits = returned.new_waits.unwrap();
        assert_eq!(waits["w1"].wait_until().timestamp(), 1_767_225_900);
        assert_eq!(waits["w2"].wait_until().timestamp(), 1_767_225_960);
    }

    #[test]
    fn retry_delay_doubles_from_the_base() {
        let base = Duration::minutes(3);
        assert_eq!(retry_delay(base, 0), Duration::zero());
        assert_eq!(retry_delay(base, 1), Duration::minutes(3));
        assert_eq!(retry_delay(base, 3), Duration::minutes(12));
    }

    #[tokio::test]
    async fn workflow_completes_with_the_returned_result() {
        let h = harness();
        let tenant = h.tenant().await;
        let wf = workflow(&h, &tenant.id, 2).await;

        let step = lease_step(&h).await;
        assert_eq!(step.request.method, "POST");
        assert_eq!(body(&step)["input"], json!({ "order": 7 }));
        answer(&h, &step, response(200, json!({ "new_steps": { "charge": "ok" } }))).await;

        tick_workflow(&h.state, &wf.id, h.clock.now()).await.unwrap();
        let step = lease_step(&h).await;
        assert_eq!(body(&step)["steps"]["charge"], json!("ok"));
        answer(&h, &step, response(200, json!({ "result": { "shipped": true } }))).await;

        let decision = tick_workflow(&h.state, &wf.id, h.clock.now()).await.unwrap();
        assert_eq!(
            decision,
            WorkflowDecision::Complete {
                result: json!({ "shipped": true })
            }
        );
        let stored = h.state.workflows.find_workflow(&wf.id).await.unwrap().unwrap();
        assert_eq!(stored.status.result(), Some(&json!({ "shipped": true })));
        assert!(stored.finished_at.is_some());
    }

    #[tokio::test]
    async fn failed_steps_retry_with_backoff_then_fail_the_workflow() {
        let h = harness();
        let tenant = h.tenant().await;
        let wf = workflow(&h, &tenant.id, 1).await;

        let step = lease_step(&h).await;
        answer(&h, &step, ReportedResult::Error("connection reset".into())).await;

        let decision = tick_workflow(&h.state, &wf.id, h.clock.now()).await.unwrap();
        let WorkflowDecision::EmitStep { scheduled_at, .. } = decision else {
            panic!("expected a retry emission, got {:?}", decision);
        };
        assert_eq!(scheduled_at, h.clock.now() + Duration::minutes(3));

        h.clock.advance(Duration::minutes(3));
        let step = lease_step(&h).await;
        assert_eq!(body(&step)["prev_errors"][0]["message"], json!("connection reset"));
        answer(&h, &step, response(500, json!({}))).await;

        let decision = tick_workflow(&h.state, &wf.id, h.clock.now()).await.unwrap();
        assert!(matches!(decision, WorkflowDecision::Fail { .. }));
        let stored = h.state.workflows.find_workflow(&wf.id).await.unwrap().unwrap();
        assert_eq!(stored.status.error(), Some("step responded with status 500"));
    }

    #[tokio::test]
    async fn no_progress_counts_as_a_retry() {
        let h = harness();
        let tenant = h.tenant().await;
        let wf = workflow(&h, &tenant.id, 0).await;

        let step = lease_step(&h).await;
        answer(&h, &step, response(200, json!({}))).await;

        let decision = tick_workflow(&h.state, &wf.id, h.clock.now()).await.unwrap();
        assert!(matches!(decision, WorkflowDecision::Fail { .. }));
    }

    #[tokio::test]
    async fn execution_waits_for_child_and_timer() {
        let h = harness();
        let tenant = h.tenant().await;
        let wf = workflow(&h, &tenant.id, 0).await;
        let t0 = h.clock.now();

        let step = lease_step(&h).await;
        answer(
            &h,
            &step,
            response(
                200,
                json!({
                    "new_children": { "invoice": { "url": "https://child.test/run", "input": { "n": 1 } } },
                    "new_waits": { "cool_off": { "wait_until": (t0 + Duration::minutes(5)).timestamp() } }
                }),
            ),
        )
        .await;

        let decision = tick_workflow(&h.state, &wf.id, t0).await.unwrap();
        let WorkflowDecision::Waiting { unresolved, .. } = decision else {
            panic!("expected waiting, got {:?}", decision);
        };
        assert_eq!(unresolved.len(), 2);

        let snapshot = h.state.workflows.load_snapshot(&wf.id).await.unwrap().unwrap();
        let child_id = snapshot
            .dependencies
            .iter()
            .find_map(|DependencyState { dependency, .. }| match &dependency.kind {
                DependencyKind::ChildWorkflow { workflow_id, .. } => Some(workflow_id.clone()),
                _ => None,
            })
            .unwrap();
        let child = h.state.workflows.find_workflow(&child_id).await.unwrap().unwrap();
        assert_eq!(child.parent_workflow_id.as_deref(), Some(wf.id.as_str()));
        assert_eq!(child.tenant_id, tenant.id);
        assert_eq!(child.max_retries, 9);

        h.clock.advance(Duration::minutes(5));
        let decision = tick_workflow(&h.state, &wf.id, h.clock.now()).await.unwrap();
        assert!(
            matches!(&decision, WorkflowDecision::Waiting { unresolved, .. } if unresolved == &vec!["invoice".to_string()])
        );

        tick_workflow(&h.state, &child_id, h.clock.now()).await.unwrap();
        let child_step = lease_step(&h).await;
        assert_eq!(child_step.request.url, "https://child.test/run");
        answer(&h, &child_step, response(200, json!({ "result": 99 }))).await;
        tick_workflow(&h.state, &child_id, h.clock.now()).await.unwrap();

        let decision = tick_workflow(&h.state, &wf.id, h.clock.now()).await.unwrap();
        assert!(matches!(decision, WorkflowDecision::EmitStep { .. }));
        let step = lease_step(&h).await;
        let context = body(&step);
        assert_eq!(context["child_workflows"]["invoice"], json!({ "type": "success", "data": 99 }));
        assert_eq!(context["completed_waits"], json!(["cool_off"]));
    }

    #[tokio::test]
    async fn rate_limited_emission_leaves_the_execution_waiting() {
        let h = harness();
        let tenant = h.tenant_with(1, Default::default()).await;
        h.submit(&tenant.id, "eu", 0).await;

        let wf = workflow(&h, &tenant.id, 0).await;
        let snapshot = h.state.workflows.load_snapshot(&wf.id).await.unwrap().unwrap();
        assert_eq!(snapshot.executions.len(), 1);
        assert_eq!(snapshot.executions[0].status, ExecutionStatus::Waiting);

        h.clock.advance(Duration::minutes(1));
        let decision = tick_workflow(&h.state, &wf.id, h.clock.now()).await.unwrap();
        assert!(matches!(decision, WorkflowDecision::EmitStep { .. }));
    }

    #[tokio::test]
    async fn only_one_execution_is_ever_open() {
        let h = harness();
        let tenant = h.tenant().await;
        let wf = workflow(&h, &tenant.id, 0).await;
        let snapshot = h.state.workflows.load_snapshot(&wf.id).await.unwrap().unwrap();

        let again = start_execution_rows(&h.state, &snapshot.workflow, 1, false, &[], &[], h.clock.now());
        assert!(matches!(
            h.state.workflows.start_execution(&again).await,
            Err(SchedulerError::Conflict(_))
        ));
    }
}
