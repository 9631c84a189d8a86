use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;

use super::{error_response, ApiKey, TenantAuth};
use crate::engine::{key_rotation, submission};
use crate::errors::SchedulerError;
use crate::models::tenant::NewTenant;
use crate::state::AppState;

/// Tenants only ever see themselves.
fn same_tenant(auth: &TenantAuth, tenant_id: &str) -> Result<(), SchedulerError> {
    if auth.tenant_id == tenant_id {
        Ok(())
    } else {
        Err(SchedulerError::NotFound("tenant"))
    }
}

pub async fn create_tenant(
    State(state): State<AppState>,
    _key: ApiKey,
    Json(payload): Json<NewTenant>,
) -> Response {
    let now = state.clock.now();
    match submission::create_tenant(&state, payload, now).await {
        Ok(tenant) => (
            StatusCode::CREATED,
            Json(json!({ "success": true, "tenant": tenant })),
        )
            .into_response(),
        Err(e) => error_response(e, now),
    }
}

pub async fn get_tenant(
    State(state): State<AppState>,
    auth: TenantAuth,
    Path(tenant_id): Path<String>,
) -> Response {
    let now = state.clock.now();
    let result = match same_tenant(&auth, &tenant_id) {
        Ok(()) => submission::load_tenant(&state, &tenant_id).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(tenant) => Json(json!({ "success": true, "tenant": tenant })).into_response(),
        Err(e) => error_response(e, now),
    }
}

pub async fn rotate_signing_keys(
    State(state): State<AppState>,
    auth: TenantAuth,
    Path(tenant_id): Path<String>,
) -> Response {
    let now = state.clock.now();
    let result = match same_tenant(&auth, &tenant_id) {
        Ok(()) => key_rotation::rotate_signing_key(&state, &tenant_id, now).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(keys) => Json(json!({ "success": true, "signing_keys": keys })).into_response(),
        Err(e) => error_response(e, now),
    }
}

pub async fn reveal_signing_keys(
    State(state): State<AppState>,
    auth: TenantAuth,
    Path(tenant_id): Path<String>,
) -> Response {
    let now = state.clock.now();
    let result = match same_tenant(&auth, &tenant_id) {
        Ok(()) => key_rotation::reveal_signing_keys(&state, &tenant_id).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(keys) => Json(json!({ "success": true, "signing_keys": keys })).into_response(),
        Err(e) => error_response(e, now),
    }
}

#[derive(Debug, Deserialize)]
pub struct VerifyPayload {
    pub signature: String,
    pub path: String,
    #[serde(default)]
    pub body: Option<String>,
}

pub async fn verify_signature(
    State(state): State<AppState>,
    auth: TenantAuth,
    Json(payload): Json<VerifyPayload>,
) -> Response {
    let now = state.clock.now();
    match key_rotation::verify_callback(
        &state,
        &auth.tenant_id,
        &payload.signature,
        &payload.path,
        payload.body.as_deref(),
        now,
    )
    .await
    {
        Ok(valid) => Json(json!({ "success": true, "valid": valid })).into_response(),
        Err(e) => error_response(e, now),
    }
}

pub async fn verify_job(
    State(state): State<AppState>,
    auth: TenantAuth,
    Path(job_id): Path<String>,
) -> Response {
    let now = state.clock.now();
    match submission::verify_job(&state, &auth.tenant_id, &job_id).await {
        Ok(verification) => Json(verification).into_response(),
        Err(e) => error_response(e, now),
    }
}

#[cfg(test)]
mod tests {
    use super::super::router;
    use super::super::test_helpers::*;
    use crate::clock::Clock;
    use crate::engine::lease;
    use crate::state::test_support::{harness, API_KEY};
    use axum::{
        body::Body,
        http::{header, Method, Request, StatusCode},
    };
    use serde_json::json;

    #[tokio::test]
    async fn onboarding_needs_only_an_api_key() {
        let h = harness();
        let app = router(h.state.clone());
        let req = Request::builder()
            .method(Method::POST)
            .uri("/api/tenants")
            .header(header::AUTHORIZATION, format!("Bearer {}", API_KEY))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!({ "tokens_per_day": 1440, "max_tokens": 10 }).to_string()))
            .unwrap();
        let resp = send(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body = json_body(resp).await;
        assert_eq!(body["tenant"]["signing_keys"]["state"], "unprovisioned");
    }

    #[tokio::test]
    async fn invalid_limits_are_rejected() {
        let h = harness();
        let app = router(h.state.clone());
        let req = Request::builder()
            .method(Method::POST)
            .uri("/api/tenants")
            .header(header::AUTHORIZATION, format!("Bearer {}", API_KEY))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                json!({ "tokens_per_day": 0, "max_tokens": 10 }).to_string(),
            ))
            .unwrap();
        assert_eq!(send(&app, req).await.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn other_tenants_are_not_found() {
        let h = harness();
        let mine = h.tenant().await;
        let theirs = h.tenant().await;
        let app = router(h.state.clone());

        let own = tenant_request(Method::GET, &format!("/api/tenants/{}", mine.id), &mine.id, None);
        assert_eq!(send(&app, own).await.status(), StatusCode::OK);

        let other = tenant_request(Method::GET, &format!("/api/tenants/{}", theirs.id), &mine.id, None);
        assert_eq!(send(&app, other).await.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn rotation_provisions_then_rolls_then_conflicts() {
        let h = harness();
        let tenant = h.tenant().await;
        let app = router(h.state.clone());
        let uri = format!("/api/tenants/{}/signing-keys/rotate", tenant.id);

        let first = send(&app, tenant_request(Method::POST, &uri, &tenant.id, None)).await;
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(json_body(first).await["signing_keys"]["state"], "dual");

        let second = send(&app, tenant_request(Method::POST, &uri, &tenant.id, None)).await;
        assert_eq!(json_body(second).await["signing_keys"]["state"], "rolling");

        let third = send(&app, tenant_request(Method::POST, &uri, &tenant.id, None)).await;
        assert_eq!(third.status(), StatusCode::CONFLICT);

        let reveal = tenant_request(
            Method::GET,
            &format!("/api/tenants/{}/signing-keys", tenant.id),
            &tenant.id,
            None,
        );
        let keys = json_body(send(&app, reveal).await).await;
        assert!(keys["signing_keys"]["current"].is_string());
        assert!(keys["signing_keys"]["promote_at"].is_string());
    }

    #[tokio::test]
    async fn verify_reports_invalid_signatures() {
        let h = harness();
        let tenant = h.tenant().await;
        let app = router(h.state.clone());
        let rotate = format!("/api/tenants/{}/signing-keys/rotate", tenant.id);
        send(&app, tenant_request(Method::POST, &rotate, &tenant.id, None)).await;

        let req = tenant_request(
            Method::POST,
            "/api/verify",
            &tenant.id,
            Some(json!({ "signature": "{\"t\":0,\"p\":\"/hook\",\"v1\":\"00\"}", "path": "/hook" })),
        );
        let resp = send(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["valid"], false);
    }

    #[tokio::test]
    async fn dispatched_jobs_verify_with_a_body_hash() {
        let h = harness();
        let tenant = h.tenant().await;
        let stranger = h.tenant().await;
        let app = router(h.state.clone());
        let payload = json!({
            "region": "eu",
            "request": { "method": "POST", "url": "https://tenant.test/hook", "body": "hello" }
        });
        let created = json_body(send(&app, tenant_request(Method::POST, "/api/jobs", &tenant.id, Some(payload))).await).await;
        let job_id = created["job"]["id"].as_str().unwrap().to_string();
        let uri = format!("/api/verify/{}", job_id);

        let undispatched = json_body(send(&app, tenant_request(Method::GET, &uri, &tenant.id, None)).await).await;
        assert_eq!(undispatched, json!({ "verified": false, "hash": null }));

        h.drone("drone-1", "eu").await;
        lease::lease_next(&h.state, "drone-1", "eu", h.clock.now())
            .await
            .unwrap()
            .unwrap();
        let resp = send(&app, tenant_request(Method::GET, &uri, &tenant.id, None)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            json_body(resp).await,
            json!({
                "verified": true,
                "hash": "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
            })
        );

        let foreign = json_body(send(&app, tenant_request(Method::GET, &uri, &stranger.id, None)).await).await;
        assert_eq!(foreign["verified"], false);
        let unknown = json_body(send(&app, tenant_request(Method::GET, "/api/verify/job_nope", &tenant.id, None)).await).await;
        assert_eq!(unknown["verified"], false);
    }
}
