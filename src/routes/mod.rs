//! HTTP surface: tenant API under `/api`, drone API under `/drone`.

pub mod cron;
pub mod drones;
pub mod executions;
pub mod jobs;
pub mod tenants;
pub mod workflows;

use axum::{
    extract::FromRequestParts,
    http::request::Parts,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    typed_header::TypedHeader,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tracing::error;

use crate::db::job_repository::Page;
use crate::engine::submission;
use crate::errors::SchedulerError;
use crate::responses::JsonResponse;
use crate::state::AppState;

pub const TENANT_HEADER: &str = "x-tenant-id";

fn key_matches(accepted: &[String], presented: &str) -> bool {
    accepted.iter().fold(0u8, |found, key| {
        found | key.as_bytes().ct_eq(presented.as_bytes()).unwrap_u8()
    }) == 1
}

async fn bearer_token(parts: &mut Parts, state: &AppState) -> Result<String, Response> {
    let TypedHeader(Authorization(bearer)) =
        TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
            .await
            .map_err(|_| JsonResponse::unauthorized("Missing bearer token").into_response())?;
    Ok(bearer.token().to_string())
}

/// Caller presented one of the configured API keys.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiKey;

impl FromRequestParts<AppState> for ApiKey {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts, state).await?;
        if !key_matches(&state.config.api_auth_keys, &token) {
            return Err(JsonResponse::unauthorized("Invalid API key").into_response());
        }
        Ok(ApiKey)
    }
}

/// API key plus the tenant the call acts for.
#[derive(Debug, Clone, PartialEq)]
pub struct TenantAuth {
    pub tenant_id: String,
}

impl FromRequestParts<AppState> for TenantAuth {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        ApiKey::from_request_parts(parts, state).await?;
        let tenant_id = parts
            .headers
            .get(TENANT_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| JsonResponse::bad_request("X-Tenant-Id header is required").into_response())?;
        Ok(TenantAuth {
            tenant_id: tenant_id.to_string(),
        })
    }
}

/// Caller presented the shared drone key.
#[derive(Debug, Clone, PartialEq)]
pub struct DroneAuth;

impl FromRequestParts<AppState> for DroneAuth {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts, state).await?;
        if !key_matches(std::slice::from_ref(&state.config.drone_auth_key), &token) {
            return Err(JsonResponse::unauthorized("Invalid drone key").into_response());
        }
        Ok(DroneAuth)
    }
}

/// `?cursor=<last id seen>&limit=<n>` on list endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageQuery {
    pub cursor: Option<String>,
    pub limit: Option<i64>,
}

impl PageQuery {
    pub fn page(self) -> Page {
        submission::page(self.cursor, self.limit)
    }
}

/// Renders a `SchedulerError` as a `JsonResponse`. Server-side failures are
/// logged and their details withheld.
pub fn error_response(err: SchedulerError, now: DateTime<Utc>) -> Response {
    match &err {
        SchedulerError::RateLimited { retry_at, .. } => {
            let wait = (*retry_at - now).num_milliseconds();
            let secs = (wait + 999) / 1000;
            JsonResponse::too_many_requests(&err.to_string(), Some(secs))
        }
        SchedulerError::StaleLease { .. } => {
            JsonResponse::conflict_with_code(&err.to_string(), "stale_lease").into_response()
        }
        SchedulerError::Validation(msg) => JsonResponse::bad_request(msg).into_response(),
        SchedulerError::NotFound(_) => JsonResponse::not_found(&err.to_string()).into_response(),
        SchedulerError::Conflict(msg) => JsonResponse::conflict(msg).into_response(),
        SchedulerError::DroneNotEligible { .. } => {
            JsonResponse::forbidden_with_code(&err.to_string(), "drone_not_eligible").into_response()
        }
        SchedulerError::Corrupt(_) | SchedulerError::Encryption(_) | SchedulerError::Database(_) => {
            error!(error = %err, "request failed");
            JsonResponse::server_error("Internal server error").into_response()
        }
    }
}

/// Every route, with state applied. Global layers are added by the binary.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/tenants", post(tenants::create_tenant))
        .route("/tenants/{tenant_id}", get(tenants::get_tenant))
        .route(
            "/tenants/{tenant_id}/signing-keys",
            get(tenants::reveal_signing_keys),
        )
        .route(
            "/tenants/{tenant_id}/signing-keys/rotate",
            post(tenants::rotate_signing_keys),
        )
        .route("/verify", post(tenants::verify_signature))
        .route("/verify/{job_id}", get(tenants::verify_job))
        .route("/jobs", post(jobs::submit_job).get(jobs::list_jobs))
        .route("/jobs/{job_id}", get(jobs::get_job).delete(jobs::cancel_job))
        .route("/executions", get(executions::list_executions))
        .route("/executions/{job_id}", get(executions::get_execution))
        .route(
            "/cron",
            post(cron::create_cron_job).get(cron::list_cron_jobs),
        )
        .route(
            "/cron/{cron_id}",
            get(cron::get_cron_job)
                .post(cron::update_cron_job)
                .delete(cron::delete_cron_job),
        )
        .route("/workflows", post(workflows::create_workflow))
        .route("/workflows/{workflow_id}", get(workflows::get_workflow));

    let drone = Router::new()
        .route("/heartbeat", post(drones::heartbeat))
        .route("/lease", post(drones::lease))
        .route("/report", post(drones::report));

    Router::new()
        .nest("/api", api)
        .nest("/drone", drone)
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod test_helpers {
    use axum::{
        body::Body,
        http::{header, Method, Request},
        response::Response,
        Router,
    };
    use serde_json::Value;
    use tower::ServiceExt;

    use super::TENANT_HEADER;
    use crate::state::test_support::{API_KEY, DRONE_KEY};

    pub fn tenant_request(method: Method, uri: &str, tenant_id: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", API_KEY))
            .header(TENANT_HEADER, tenant_id)
            .header(header::CONTENT_TYPE, "application/json");
        builder
            .body(body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty))
            .unwrap()
    }

    pub fn drone_request(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", DRONE_KEY))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    pub async fn send(app: &Router, req: Request<Body>) -> Response {
        app.clone().oneshot(req).await.unwrap()
    }

    pub async fn json_body(resp: Response) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        if bytes.is_empty() {
            return Value::Null;
        }
        serde_json::from_slice(&bytes).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_helpers::*;
    use super::*;
    use crate::state::test_support::harness;
    use axum::{
        body::Body,
        http::{header, Method, Request, StatusCode},
    };
    use chrono::Duration;

    #[test]
    fn key_matching_is_exact() {
        let keys = vec!["alpha".to_string(), "beta".to_string()];
        assert!(key_matches(&keys, "beta"));
        assert!(!key_matches(&keys, "bet"));
        assert!(!key_matches(&keys, "betaa"));
        assert!(!key_matches(&[], "alpha"));
    }

    #[tokio::test]
    async fn rate_limited_maps_to_429_with_retry_after() {
        let now = chrono::Utc::now();
        let resp = error_response(
            SchedulerError::RateLimited {
                tenant_id: "tenant_1".into(),
                retry_at: now + Duration::milliseconds(1500),
            },
            now,
        );
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers().get(header::RETRY_AFTER).unwrap(), "2");
    }

    #[tokio::test]
    async fn errors_map_to_statuses() {
        let now = chrono::Utc::now();
        let cases = [
            (SchedulerError::stale("job_1"), StatusCode::CONFLICT),
            (SchedulerError::validation("bad"), StatusCode::BAD_REQUEST),
            (SchedulerError::NotFound("job"), StatusCode::NOT_FOUND),
            (SchedulerError::Conflict("dup".into()), StatusCode::CONFLICT),
            (
                SchedulerError::DroneNotEligible {
                    drone_id: "d".into(),
                    region: "eu".into(),
                },
                StatusCode::FORBIDDEN,
            ),
            (SchedulerError::Corrupt("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(error_response(err, now).status(), status);
        }
    }

    #[tokio::test]
    async fn tenant_routes_require_api_key_and_tenant_header() {
        let h = harness();
        let app = router(h.state.clone());

        let anonymous = Request::builder()
            .method(Method::GET)
            .uri("/api/jobs/job_x")
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(&app, anonymous).await.status(), StatusCode::UNAUTHORIZED);

        let wrong_key = Request::builder()
            .method(Method::GET)
            .uri("/api/jobs/job_x")
            .header(header::AUTHORIZATION, "Bearer nope")
            .header(TENANT_HEADER, "tenant_1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(&app, wrong_key).await.status(), StatusCode::UNAUTHORIZED);

        let no_tenant = Request::builder()
            .method(Method::GET)
            .uri("/api/jobs/job_x")
            .header(
                header::AUTHORIZATION,
                format!("Bearer {}", crate::state::test_support::API_KEY),
            )
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(&app, no_tenant).await.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn drone_routes_reject_api_keys() {
        let h = harness();
        let app = router(h.state.clone());
        let req = Request::builder()
            .method(Method::POST)
            .uri("/drone/heartbeat")
            .header(
                header::AUTHORIZATION,
                format!("Bearer {}", crate::state::test_support::API_KEY),
            )
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{}"))
            .unwrap();
        assert_eq!(send(&app, req).await.status(), StatusCode::UNAUTHORIZED);
    }
}
