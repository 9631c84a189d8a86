use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::engine::key_rotation::SigningKeys;
use crate::engine::rate_limiter::TokenBucket;
use crate::errors::SchedulerError;

/// Ceilings every submission is validated against.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TenantLimits {
    pub max_timeout_ms: i32,
    pub max_max_response_bytes: i32,
    pub max_request_bytes: i32,
    pub max_cron_jobs: i32,
    pub retain_for_days: i32,
    pub max_delay_days: i32,
}

impl Default for TenantLimits {
    fn default() -> Self {
        Self {
            max_timeout_ms: 120_000,
            max_max_response_bytes: 1_048_576,
            max_request_bytes: 65_536,
            max_cron_jobs: 25,
            retain_for_days: 7,
            max_delay_days: 30,
        }
    }
}

impl TenantLimits {
    pub fn validate(&self) -> Result<(), String> {
        let fields = [
            ("max_timeout_ms", self.max_timeout_ms),
            ("max_max_response_bytes", self.max_max_response_bytes),
            ("max_request_bytes", self.max_request_bytes),
            ("max_cron_jobs", self.max_cron_jobs),
            ("retain_for_days", self.retain_for_days),
            ("max_delay_days", self.max_delay_days),
        ];
        for (name, value) in fields {
            if value <= 0 {
                return Err(format!("{} must be positive", name));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tenant {
    pub id: String,
    pub bucket: TokenBucket,
    pub limits: TenantLimits,
    pub default_retries: i32,
    pub signing_keys: SigningKeys,
    pub created_at: DateTime<Utc>,
}

/// Flat `tenants` row.
#[derive(Debug, Clone, FromRow)]
pub struct TenantRow {
    pub id: String,
    pub tokens: i32,
    pub max_tokens: i32,
    pub increment: i32,
    pub period_ms: i64,
    pub next_increment: DateTime<Utc>,
    pub max_timeout_ms: i32,
    pub max_max_response_bytes: i32,
    pub max_request_bytes: i32,
    pub max_cron_jobs: i32,
    pub retain_for_days: i32,
    pub max_delay_days: i32,
    pub default_retries: i32,
    pub current_signing_key: Option<String>,
    pub next_signing_key: Option<String>,
    pub signing_promote_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<TenantRow> for Tenant {
    type Error = SchedulerError;

    fn try_from(row: TenantRow) -> Result<Self, Self::Error> {
        let corrupt = |msg: String| SchedulerError::Corrupt(format!("tenant {}: {}", row.id, msg));
        let bucket = TokenBucket::from_parts(
            row.tokens,
            row.max_tokens,
            row.increment,
            row.period_ms,
            row.next_increment,
        )
        .map_err(corrupt)?;
        let signing_keys = SigningKeys::from_columns(
            row.current_signing_key.clone(),
            row.next_signing_key.clone(),
            row.signing_promote_at,
        )
        .map_err(corrupt)?;

        Ok(Tenant {
            bucket,
            limits: TenantLimits {
                max_timeout_ms: row.max_timeout_ms,
                max_max_response_bytes: row.max_max_response_bytes,
                max_request_bytes: row.max_request_bytes,
                max_cron_jobs: row.max_cron_jobs,
                retain_for_days: row.retain_for_days,
                max_delay_days: row.max_delay_days,
            },
            default_retries: row.default_retries,
            signing_keys,
            created_at: row.created_at,
            id: row.id,
        })
    }
}

/// Onboarding payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTenant {
    pub tokens_per_day: i32,
    pub max_tokens: i32,
    #[serde(default)]
    pub limits: Option<TenantLimits>,
    #[serde(default)]
    pub default_retries: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn row() -> TenantRow {
        let now = Utc::now();
        TenantRow {
            id: "tenant_1".into(),
            tokens: 3,
            max_tokens: 10,
            increment: 1,
            period_ms: 60_000,
            next_increment: now + Duration::minutes(1),
            max_timeout_ms: 120_000,
            max_max_response_bytes: 1024,
            max_request_bytes: 1024,
            max_cron_jobs: 5,
            retain_for_days: 7,
            max_delay_days: 30,
            default_retries: 3,
            current_signing_key: Some("secret_a".into()),
            next_signing_key: Some("secret_b".into()),
            signing_promote_at: None,
            created_at: now,
        }
    }

    #[test]
    fn row_converts_into_tenant() {
        let tenant = Tenant::try_from(row()).unwrap();
        assert_eq!(tenant.bucket.tokens(), 3);
        assert_eq!(
            tenant.signing_keys,
            SigningKeys::Dual {
                current: "secret_a".into(),
                next: "secret_b".into()
            }
        );
    }

    #[test]
    fn rows_with_a_single_signing_key_are_corrupt() {
        let mut r = row();
        r.next_signing_key = None;
        assert!(matches!(Tenant::try_from(r), Err(SchedulerError::Corrupt(_))));
    }

    #[test]
    fn rows_with_overfull_buckets_are_corrupt() {
        let mut r = row();
        r.tokens = 11;
        assert!(matches!(Tenant::try_from(r), Err(SchedulerError::Corrupt(_))));
    }

    #[test]
    fn limits_must_be_positive() {
        let mut limits = TenantLimits::default();
        assert!(limits.validate().is_ok());
        limits.max_cron_jobs = 0;
        assert!(limits.validate().is_err());
    }
}
