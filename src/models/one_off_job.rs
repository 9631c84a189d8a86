use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::http::NewHttpRequest;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct OneOffJob {
    pub id: String,
    pub tenant_id: String,
    pub region: String,
    pub request_id: String,
    pub execute_at: DateTime<Utc>,
    pub timeout_ms: Option<i32>,
    pub max_retries: i32,
    pub max_response_bytes: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Tenant payload for `POST /api/jobs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOneOffJob {
    pub region: String,
    pub execute_at: Option<DateTime<Utc>>,
    pub request: NewHttpRequest,
    #[serde(default)]
    pub timeout_ms: Option<i32>,
    #[serde(default)]
    pub max_retries: Option<i32>,
    #[serde(default)]
    pub max_response_bytes: Option<i32>,
}
