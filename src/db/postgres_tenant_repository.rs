use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};

use super::conflict_on_unique;
use super::postgres_secret_repository::insert_secret;
use super::tenant_repository::TenantRepository;
use crate::engine::key_rotation::SigningKeys;
use crate::engine::rate_limiter::{admit_tenant, TokenBucket};
use crate::errors::{SchedulerError, SchedulerResult};
use crate::models::secret::Secret;
use crate::models::tenant::{Tenant, TenantRow};

pub(crate) const TENANT_COLUMNS: &str = "id, tokens, max_tokens, increment, period_ms, next_increment, \
     max_timeout_ms, max_max_response_bytes, max_request_bytes, max_cron_jobs, retain_for_days, \
     max_delay_days, default_retries, current_signing_key, next_signing_key, signing_promote_at, created_at";

pub struct PostgresTenantRepository {
    pub pool: PgPool,
}

async fn lock_tenant(conn: &mut PgConnection, tenant_id: &str) -> SchedulerResult<Option<Tenant>> {
    let sql = format!("SELECT {} FROM tenants WHERE id = $1 FOR UPDATE", TENANT_COLUMNS);
    sqlx::query_as::<_, TenantRow>(&sql)
        .bind(tenant_id)
        .fetch_optional(&mut *conn)
        .await?
        .map(Tenant::try_from)
        .transpose()
}

async fn store_bucket(conn: &mut PgConnection, tenant_id: &str, bucket: &TokenBucket) -> SchedulerResult<()> {
    sqlx::query("UPDATE tenants SET tokens = $2, next_increment = $3 WHERE id = $1")
        .bind(tenant_id)
        .bind(bucket.tokens())
        .bind(bucket.next_increment())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Admission inside the caller's transaction. The tenant row stays locked
/// until that transaction ends; a refusal leaves the stored bucket untouched.
pub(crate) async fn admit_in_tx(
    conn: &mut PgConnection,
    tenant_id: &str,
    cost: i32,
    now: DateTime<Utc>,
) -> SchedulerResult<TokenBucket> {
    let tenant = lock_tenant(conn, tenant_id)
        .await?
        .ok_or(SchedulerError::NotFound("tenant"))?;
    let mut bucket = tenant.bucket;
    admit_tenant(&mut bucket, tenant_id, cost, now)?;
    store_bucket(conn, tenant_id, &bucket).await?;
    Ok(bucket)
}

#[async_trait]
impl TenantRepository for PostgresTenantRepository {
    async fn create_tenant(&self, tenant: &Tenant) -> SchedulerResult<()> {
        let (current, next, promote_at) = tenant.signing_keys.columns();
        sqlx::query(
            r#"
            INSERT INTO tenants (
                id, tokens, max_tokens, increment, period_ms, next_increment,
                max_timeout_ms, max_max_response_bytes, max_request_bytes, max_cron_jobs,
                retain_for_days, max_delay_days, default_retries,
                current_signing_key, next_signing_key, signing_promote_at, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(&tenant.id)
        .bind(tenant.bucket.tokens())
        .bind(tenant.bucket.max_tokens())
        .bind(tenant.bucket.increment())
        .bind(tenant.bucket.period_ms())
        .bind(tenant.bucket.next_increment())
        .bind(tenant.limits.max_timeout_ms)
        .bind(tenant.limits.max_max_response_bytes)
        .bind(tenant.limits.max_request_bytes)
        .bind(tenant.limits.max_cron_jobs)
        .bind(tenant.limits.retain_for_days)
        .bind(tenant.limits.max_delay_days)
        .bind(tenant.default_retries)
        .bind(current)
        .bind(next)
        .bind(promote_at)
        .bind(tenant.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_on_unique(e, "tenant"))?;
        Ok(())
    }

    async fn find_tenant(&self, tenant_id: &str) -> SchedulerResult<Option<Tenant>> {
        let sql = format!("SELECT {} FROM tenants WHERE id = $1", TENANT_COLUMNS);
        sqlx::query_as::<_, TenantRow>(&sql)
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Tenant::try_from)
            .transpose()
    }

    async fn admit(&self, tenant_id: &str, cost: i32, now: DateTime<Utc>) -> SchedulerResult<TokenBucket> {
        let mut tx = self.pool.begin().await?;
        let bucket = admit_in_tx(&mut tx, tenant_id, cost, now).await?;
        tx.commit().await?;
        Ok(bucket)
    }

    async fn refill_due(&self, now: DateTime<Utc>, limit: i64) -> SchedulerResult<u64> {
        let mut tx = self.pool.begin().await?;
        let sql = format!(
            "SELECT {} FROM tenants WHERE next_increment <= $1 ORDER BY next_increment LIMIT $2 FOR UPDATE SKIP LOCKED",
            TENANT_COLUMNS
        );
        let rows = sqlx::query_as::<_, TenantRow>(&sql)
            .bind(now)
            .bind(limit)
            .fetch_all(&mut *tx)
            .await?;

        let mut refilled = 0;
        for row in rows {
            let mut tenant = Tenant::try_from(row)?;
            if tenant.bucket.refill(now) {
                store_bucket(&mut tx, &tenant.id, &tenant.bucket).await?;
                refilled += 1;
            }
        }
        tx.commit().await?;
        Ok(refilled)
    }

    async fn replace_signing_keys(
        &self,
        tenant_id: &str,
        expected: &SigningKeys,
        next: &SigningKeys,
        new_secrets: &[Secret],
    ) -> SchedulerResult<()> {
        let mut tx = self.pool.begin().await?;
        let tenant = lock_tenant(&mut tx, tenant_id)
            .await?
            .ok_or(SchedulerError::NotFound("tenant"))?;
        if tenant.signing_keys != *expected {
            return Err(SchedulerError::Conflict(
                "signing keys changed concurrently".into(),
            ));
        }

        for secret in new_secrets {
            insert_secret(&mut tx, secret).await?;
        }
        let (current, next_key, promote_at) = next.columns();
        sqlx::query(
            "UPDATE tenants SET current_signing_key = $2, next_signing_key = $3, signing_promote_at = $4 WHERE id = $1",
        )
        .bind(tenant_id)
        .bind(current)
        .bind(next_key)
        .bind(promote_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn tenants_with_due_promotion(&self, now: DateTime<Utc>, limit: i64) -> SchedulerResult<Vec<Tenant>> {
        let sql = format!(
            "SELECT {} FROM tenants WHERE signing_promote_at <= $1 ORDER BY id LIMIT $2",
            TENANT_COLUMNS
        );
        sqlx::query_as::<_, TenantRow>(&sql)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Tenant::try_from)
            .collect()
    }
}
