use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;

use super::{error_response, DroneAuth};
use crate::engine::drone_registry::{self, HeartbeatRequest};
use crate::engine::lease::{self, ExecutionReport};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct LeasePayload {
    pub drone_id: String,
    pub region: String,
}

pub async fn heartbeat(
    State(state): State<AppState>,
    _auth: DroneAuth,
    Json(payload): Json<HeartbeatRequest>,
) -> Response {
    let now = state.clock.now();
    match drone_registry::heartbeat(&state, &payload, now).await {
        Ok(ack) => Json(json!({
            "success": true,
            "drone": ack.drone,
            "checkin_again_at": ack.checkin_again_at,
        }))
        .into_response(),
        Err(e) => error_response(e, now),
    }
}

/// 204 when nothing in the region is due.
pub async fn lease(
    State(state): State<AppState>,
    _auth: DroneAuth,
    Json(payload): Json<LeasePayload>,
) -> Response {
    let now = state.clock.now();
    match lease::lease_next(&state, &payload.drone_id, &payload.region, now).await {
        Ok(Some(job)) => Json(json!({ "success": true, "job": job })).into_response(),
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e, now),
    }
}

pub async fn report(
    State(state): State<AppState>,
    _auth: DroneAuth,
    Json(payload): Json<ExecutionReport>,
) -> Response {
    let now = state.clock.now();
    match lease::report(&state, &payload).await {
        Ok(recorded) => Json(json!({
            "success": true,
            "execution": recorded.execution,
            "retry_job_id": recorded.retry.map(|job| job.id),
        }))
        .into_response(),
        Err(e) => error_response(e, now),
    }
}
