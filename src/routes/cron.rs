use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use super::{error_response, PageQuery, TenantAuth};
use crate::engine::submission;
use crate::models::cron_job::{CronJobUpdate, NewCronJob};
use crate::state::AppState;

pub async fn create_cron_job(
    State(state): State<AppState>,
    auth: TenantAuth,
    Json(payload): Json<NewCronJob>,
) -> Response {
    let now = state.clock.now();
    match submission::create_cron_job(&state, &auth.tenant_id, payload, now).await {
        Ok(cron) => (
            StatusCode::CREATED,
            Json(json!({ "success": true, "cron_job": cron })),
        )
            .into_response(),
        Err(e) => error_response(e, now),
    }
}

pub async fn get_cron_job(
    State(state): State<AppState>,
    auth: TenantAuth,
    Path(cron_id): Path<String>,
) -> Response {
    let now = state.clock.now();
    match submission::cron_for_tenant(&state, &auth.tenant_id, &cron_id).await {
        Ok(cron) => Json(json!({ "success": true, "cron_job": cron })).into_response(),
        Err(e) => error_response(e, now),
    }
}

pub async fn list_cron_jobs(
    State(state): State<AppState>,
    auth: TenantAuth,
    Query(query): Query<PageQuery>,
) -> Response {
    let now = state.clock.now();
    let page = query.page();
    match submission::list_cron_jobs(&state, &auth.tenant_id, &page).await {
        Ok(crons) => {
            let cursor = crons.last().map(|cron| cron.id.clone());
            Json(json!({ "success": true, "cron_jobs": crons, "cursor": cursor })).into_response()
        }
        Err(e) => error_response(e, now),
    }
}

pub async fn update_cron_job(
    State(state): State<AppState>,
    auth: TenantAuth,
    Path(cron_id): Path<String>,
    Json(payload): Json<CronJobUpdate>,
) -> Response {
    let now = state.clock.now();
    match submission::update_cron_job(&state, &auth.tenant_id, &cron_id, payload, now).await {
        Ok(cron) => Json(json!({ "success": true, "cron_job": cron })).into_response(),
        Err(e) => error_response(e, now),
    }
}

pub async fn delete_cron_job(
    State(state): State<AppState>,
    auth: TenantAuth,
    Path(cron_id): Path<String>,
) -> Response {
    let now = state.clock.now();
    match submission::delete_cron_job(&state, &auth.tenant_id, &cron_id, now).await {
        Ok(()) => crate::responses::JsonResponse::success("Cron job deleted").into_response(),
        Err(e) => error_response(e, now),
    }
}
