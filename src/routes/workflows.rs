use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use super::{error_response, TenantAuth};
use crate::engine::submission;
use crate::models::workflow::NewWorkflow;
use crate::state::AppState;

pub async fn create_workflow(
    State(state): State<AppState>,
    auth: TenantAuth,
    Json(payload): Json<NewWorkflow>,
) -> Response {
    let now = state.clock.now();
    match submission::create_workflow(&state, &auth.tenant_id, payload, now).await {
        Ok(workflow) => (
            StatusCode::CREATED,
            Json(json!({ "success": true, "workflow": workflow })),
        )
            .into_response(),
        Err(e) => error_response(e, now),
    }
}

pub async fn get_workflow(
    State(state): State<AppState>,
    auth: TenantAuth,
    Path(workflow_id): Path<String>,
) -> Response {
    let now = state.clock.now();
    match submission::workflow_for_tenant(&state, &auth.tenant_id, &workflow_id).await {
        Ok(workflow) => Json(json!({ "success": true, "workflow": workflow })).into_response(),
        Err(e) => error_response(e, now),
    }
}
