use axum::{
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use super::{error_response, TenantAuth};
use crate::db::job_repository::ExecutionFilter;
use crate::engine::submission;
use crate::state::AppState;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecutionQuery {
    pub cursor: Option<String>,
    pub limit: Option<i64>,
    pub completed: Option<bool>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub one_off_job_id: Option<String>,
    pub cron_id: Option<String>,
}

impl ExecutionQuery {
    fn into_filter(self, tenant_id: String) -> ExecutionFilter {
        ExecutionFilter {
            tenant_id,
            completed: self.completed,
            from: self.from,
            to: self.to,
            one_off_job_id: self.one_off_job_id,
            cron_job_id: self.cron_id,
            page: submission::page(self.cursor, self.limit),
        }
    }
}

pub async fn list_executions(
    State(state): State<AppState>,
    auth: TenantAuth,
    Query(query): Query<ExecutionQuery>,
) -> Response {
    let now = state.clock.now();
    let filter = query.into_filter(auth.tenant_id);
    match submission::list_executions(&state, &filter).await {
        Ok(executions) => {
            let cursor = executions.last().map(|details| details.job.id.clone());
            Json(json!({ "success": true, "executions": executions, "cursor": cursor })).into_response()
        }
        Err(e) => error_response(e, now),
    }
}

pub async fn get_execution(
    State(state): State<AppState>,
    auth: TenantAuth,
    Path(job_id): Path<String>,
) -> Response {
    let now = state.clock.now();
    match submission::job_details(&state, &auth.tenant_id, &job_id).await {
        Ok(details) => Json(json!({ "success": true, "execution": details })).into_response(),
        Err(e) => error_response(e, now),
    }
}
