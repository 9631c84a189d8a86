use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::http::NewHttpRequest;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct CronJob {
    pub id: String,
    pub tenant_id: String,
    pub region: String,
    pub request_id: String,
    pub schedule: String,
    pub timeout_ms: Option<i32>,
    pub max_retries: i32,
    pub max_response_bytes: Option<i32>,
    /// Latest occurrence already materialized (or skipped).
    pub last_scheduled_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCronJob {
    pub region: String,
    pub schedule: String,
    pub request: NewHttpRequest,
    #[serde(default)]
    pub timeout_ms: Option<i32>,
    #[serde(default)]
    pub max_retries: Option<i32>,
    #[serde(default)]
    pub max_response_bytes: Option<i32>,
}

/// Partial update. Absent fields keep their current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CronJobUpdate {
    pub region: Option<String>,
    pub schedule: Option<String>,
    pub request: Option<NewHttpRequest>,
    pub timeout_ms: Option<i32>,
    pub max_retries: Option<i32>,
    pub max_response_bytes: Option<i32>,
}
