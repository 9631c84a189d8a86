use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use super::{error_response, PageQuery, TenantAuth};
use crate::db::job_repository::SubmissionOutcome;
use crate::engine::submission;
use crate::models::one_off_job::NewOneOffJob;
use crate::state::AppState;

pub async fn submit_job(
    State(state): State<AppState>,
    auth: TenantAuth,
    Json(payload): Json<NewOneOffJob>,
) -> Response {
    let now = state.clock.now();
    match submission::submit_one_off(&state, &auth.tenant_id, payload, now).await {
        Ok(SubmissionOutcome::Created(job)) => (
            StatusCode::CREATED,
            Json(json!({ "success": true, "job": job, "collapsed": false })),
        )
            .into_response(),
        Ok(SubmissionOutcome::Collapsed(job)) => {
            Json(json!({ "success": true, "job": job, "collapsed": true })).into_response()
        }
        Err(e) => error_response(e, now),
    }
}

pub async fn get_job(
    State(state): State<AppState>,
    auth: TenantAuth,
    Path(job_id): Path<String>,
) -> Response {
    let now = state.clock.now();
    match submission::job_details(&state, &auth.tenant_id, &job_id).await {
        Ok(details) => Json(json!({ "success": true, "job": details })).into_response(),
        Err(e) => error_response(e, now),
    }
}

pub async fn list_jobs(
    State(state): State<AppState>,
    auth: TenantAuth,
    Query(query): Query<PageQuery>,
) -> Response {
    let now = state.clock.now();
    let page = query.page();
    match submission::list_jobs(&state, &auth.tenant_id, &page).await {
        Ok(jobs) => {
            let cursor = jobs.last().map(|job| job.id.clone());
            Json(json!({ "success": true, "jobs": jobs, "cursor": cursor })).into_response()
        }
        Err(e) => error_response(e, now),
    }
}

pub async fn cancel_job(
    State(state): State<AppState>,
    auth: TenantAuth,
    Path(job_id): Path<String>,
) -> Response {
    let now = state.clock.now();
    match submission::cancel_job(&state, &auth.tenant_id, &job_id, now).await {
        Ok(()) => crate::responses::JsonResponse::success("Job cancelled").into_response(),
        Err(e) => error_response(e, now),
    }
}

#[cfg(test)]
mod tests {
    use super::super::router;
    use super::super::test_helpers::*;
    use crate::clock::Clock;
    use crate::engine::lease;
    use crate::models::tenant::TenantLimits;
    use crate::state::test_support::harness;
    use axum::http::{Method, StatusCode};
    use chrono::Duration;
    use serde_json::json;

    fn job_payload(url: &str) -> serde_json::Value {
        json!({
            "region": "eu",
            "execute_at": null,
            "request": {
                "method": "POST",
                "url": url,
                "headers": ["Content-Type: application/json"],
                "body": "{\"hello\":true}"
            }
        })
    }

    #[tokio::test]
    async fn submit_then_read_back() {
        let h = harness();
        let tenant = h.tenant().await;
        let app = router(h.state.clone());

        let resp = send(
            &app,
            tenant_request(Method::POST, "/api/jobs", &tenant.id, Some(job_payload("https://tenant.test/hook"))),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let created = json_body(resp).await;
        let job_id = created["job"]["id"].as_str().unwrap().to_string();
        assert_eq!(created["job"]["max_retries"], 3);

        let read = send(
            &app,
            tenant_request(Method::GET, &format!("/api/jobs/{}", job_id), &tenant.id, None),
        )
        .await;
        assert_eq!(read.status(), StatusCode::OK);
        let details = json_body(read).await;
        assert_eq!(details["job"]["request"]["url"], "https://tenant.test/hook");
        assert!(details["job"]["execution"].is_null());
    }

    #[tokio::test]
    async fn jobs_are_scoped_to_their_tenant() {
        let h = harness();
        let owner = h.tenant().await;
        let stranger = h.tenant().await;
        let job = h.submit(&owner.id, "eu", 0).await;
        let app = router(h.state.clone());

        let resp = send(
            &app,
            tenant_request(Method::GET, &format!("/api/jobs/{}", job.id), &stranger.id, None),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn exhausted_bucket_returns_429() {
        let h = harness();
        let tenant = h.tenant_with(1, TenantLimits::default()).await;
        let app = router(h.state.clone());

        let first = send(
            &app,
            tenant_request(Method::POST, "/api/jobs", &tenant.id, Some(job_payload("https://tenant.test/a"))),
        )
        .await;
        assert_eq!(first.status(), StatusCode::CREATED);

        let second = send(
            &app,
            tenant_request(Method::POST, "/api/jobs", &tenant.id, Some(job_payload("https://tenant.test/b"))),
        )
        .await;
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(second.headers().contains_key("retry-after"));
    }

    #[tokio::test]
    async fn listing_pages_newest_first() {
        let h = harness();
        let tenant = h.tenant().await;
        let app = router(h.state.clone());

        let mut ids = Vec::new();
        for path in ["a", "b", "c"] {
            let url = format!("https://tenant.test/{}", path);
            let resp = send(&app, tenant_request(Method::POST, "/api/jobs", &tenant.id, Some(job_payload(&url)))).await;
            ids.push(json_body(resp).await["job"]["id"].as_str().unwrap().to_string());
            h.clock.advance(Duration::seconds(1));
        }

        let first = json_body(send(&app, tenant_request(Method::GET, "/api/jobs?limit=2", &tenant.id, None)).await).await;
        let page: Vec<&str> = first["jobs"].as_array().unwrap().iter().map(|j| j["id"].as_str().unwrap()).collect();
        assert_eq!(page, vec![ids[2].as_str(), ids[1].as_str()]);
        assert_eq!(first["cursor"], json!(ids[1]));

        let uri = format!("/api/jobs?limit=2&cursor={}", ids[1]);
        let second = json_body(send(&app, tenant_request(Method::GET, &uri, &tenant.id, None)).await).await;
        let page: Vec<&str> = second["jobs"].as_array().unwrap().iter().map(|j| j["id"].as_str().unwrap()).collect();
        assert_eq!(page, vec![ids[0].as_str()]);

        let stranger = h.tenant().await;
        let theirs = json_body(send(&app, tenant_request(Method::GET, "/api/jobs", &stranger.id, None)).await).await;
        assert!(theirs["jobs"].as_array().unwrap().is_empty());
        assert!(theirs["cursor"].is_null());
    }

    #[tokio::test]
    async fn cancelled_jobs_are_never_leased() {
        let h = harness();
        let tenant = h.tenant().await;
        let stranger = h.tenant().await;
        let job = h.submit(&tenant.id, "eu", 0).await;
        let app = router(h.state.clone());
        let uri = format!("/api/jobs/{}", job.id);

        let foreign = send(&app, tenant_request(Method::DELETE, &uri, &stranger.id, None)).await;
        assert_eq!(foreign.status(), StatusCode::NOT_FOUND);

        let cancelled = send(&app, tenant_request(Method::DELETE, &uri, &tenant.id, None)).await;
        assert_eq!(cancelled.status(), StatusCode::OK);
        let again = send(&app, tenant_request(Method::DELETE, &uri, &tenant.id, None)).await;
        assert_eq!(again.status(), StatusCode::NOT_FOUND);

        let listed = json_body(send(&app, tenant_request(Method::GET, "/api/jobs", &tenant.id, None)).await).await;
        assert!(listed["jobs"].as_array().unwrap().is_empty());
        let details = json_body(send(&app, tenant_request(Method::GET, &uri, &tenant.id, None)).await).await;
        assert!(details["job"]["job"]["deleted_at"].is_string());

        h.drone("drone-1", "eu").await;
        let leased = lease::lease_next(&h.state, "drone-1", "eu", h.clock.now()).await.unwrap();
        assert!(leased.is_none());
    }

    #[tokio::test]
    async fn bad_requests_are_400() {
        let h = harness();
        let tenant = h.tenant().await;
        let app = router(h.state.clone());

        let mut unknown_region = job_payload("https://tenant.test/hook");
        unknown_region["region"] = json!("mars");
        let resp = send(&app, tenant_request(Method::POST, "/api/jobs", &tenant.id, Some(unknown_region))).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = send(
            &app,
            tenant_request(Method::POST, "/api/jobs", &tenant.id, Some(job_payload("not a url"))),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
