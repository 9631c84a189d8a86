use axum::{
    http::{header::RETRY_AFTER, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
pub struct JsonResponse {
    pub status: String,
    pub success: bool,
    pub message: String,
    pub code: Option<String>,
}

impl JsonResponse {
    fn error(status: StatusCode, msg: &str, code: Option<&str>) -> (StatusCode, Json<JsonResponse>) {
        (
            status,
            Json(JsonResponse {
                status: "error".to_string(),
                success: false,
                message: msg.to_string(),
                code: code.map(str::to_string),
            }),
        )
    }

    pub fn success(msg: &str) -> impl IntoResponse {
        (
            StatusCode::OK,
            Json(JsonResponse {
                status: "success".to_string(),
                success: true,
                message: msg.to_string(),
                code: None,
            }),
        )
    }

    pub fn not_found(msg: &str) -> impl IntoResponse {
        Self::error(StatusCode::NOT_FOUND, msg, Some("not_found"))
    }

    pub fn conflict(msg: &str) -> impl IntoResponse {
        Self::error(StatusCode::CONFLICT, msg, Some("conflict"))
    }

    pub fn conflict_with_code(msg: &str, code: &str) -> impl IntoResponse {
        Self::error(StatusCode::CONFLICT, msg, Some(code))
    }

    pub fn server_error(msg: &str) -> impl IntoResponse {
        Self::error(StatusCode::INTERNAL_SERVER_ERROR, msg, None)
    }

    pub fn unauthorized(msg: &str) -> impl IntoResponse {
        Self::error(StatusCode::UNAUTHORIZED, msg, None)
    }

    pub fn bad_request(msg: &str) -> impl IntoResponse {
        Self::error(StatusCode::BAD_REQUEST, msg, Some("validation"))
    }

    pub fn forbidden_with_code(msg: &str, code: &str) -> impl IntoResponse {
        Self::error(StatusCode::FORBIDDEN, msg, Some(code))
    }

    /// 429 with a `Retry-After` in whole seconds.
    pub fn too_many_requests(msg: &str, retry_after_secs: Option<i64>) -> Response {
        let mut resp = Self::error(StatusCode::TOO_MANY_REQUESTS, msg, Some("rate_limited")).into_response();
        if let Some(secs) = retry_after_secs {
            if let Ok(value) = HeaderValue::from_str(&secs.max(0).to_string()) {
                resp.headers_mut().insert(RETRY_AFTER, value);
            }
        }
        resp
    }
}

#[cfg(test)]
mod tests {
    use axum::response::IntoResponse;
    use serde_json::from_slice;

    use crate::responses::JsonResponse;

    #[tokio::test]
    async fn test_success_response() {
        let resp = JsonResponse::success("ok").into_response();
        assert_eq!(resp.status(), axum::http::StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        let json: JsonResponse = from_slice(&body).unwrap();
        assert_eq!(json.status, "success");
        assert!(json.success);
        assert_eq!(json.message, "ok");
    }

    #[tokio::test]
    async fn test_conflict_carries_code() {
        let resp = JsonResponse::conflict_with_code("lease is stale", "stale_lease").into_response();
        assert_eq!(resp.status(), axum::http::StatusCode::CONFLICT);

        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        let json: JsonResponse = from_slice(&body).unwrap();
        assert_eq!(json.status, "error");
        assert!(!json.success);
        assert_eq!(json.code.as_deref(), Some("stale_lease"));
    }

    #[tokio::test]
    async fn test_too_many_requests_sets_retry_after() {
        let resp = JsonResponse::too_many_requests("slow down", Some(42));
        assert_eq!(resp.status(), axum::http::StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers().get("retry-after").unwrap(), "42");

        let negative = JsonResponse::too_many_requests("slow down", Some(-5));
        assert_eq!(negative.headers().get("retry-after").unwrap(), "0");
    }
}
