use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::engine::key_rotation::SigningKeys;
use crate::engine::rate_limiter::TokenBucket;
use crate::errors::SchedulerResult;
use crate::models::secret::Secret;
use crate::models::tenant::Tenant;

#[async_trait]
pub trait TenantRepository: Send + Sync {
    async fn create_tenant(&self, tenant: &Tenant) -> SchedulerResult<()>;

    async fn find_tenant(&self, tenant_id: &str) -> SchedulerResult<Option<Tenant>>;

    /// Refill then take `cost` tokens as one atomic step. Fails with
    /// `RateLimited` without touching the stored bucket.
    async fn admit(
        &self,
        tenant_id: &str,
        cost: i32,
        now: DateTime<Utc>,
    ) -> SchedulerResult<TokenBucket>;

    /// Credits elapsed refill periods for tenants whose `next_increment` has passed.
    async fn refill_due(&self, now: DateTime<Utc>, limit: i64) -> SchedulerResult<u64>;

    /// Compare-and-swap on the stored signing key state. `new_secrets` are
    /// inserted in the same transaction. A mismatch is a `Conflict`.
    async fn replace_signing_keys(
        &self,
        tenant_id: &str,
        expected: &SigningKeys,
        next: &SigningKeys,
        new_secrets: &[Secret],
    ) -> SchedulerResult<()>;

    async fn tenants_with_due_promotion(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> SchedulerResult<Vec<Tenant>>;
}
