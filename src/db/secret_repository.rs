use async_trait::async_trait;

use crate::errors::SchedulerResult;
use crate::models::secret::Secret;

#[async_trait]
pub trait SecretRepository: Send + Sync {
    async fn find_secret(&self, secret_id: &str) -> SchedulerResult<Option<Secret>>;

    /// Secrets still referenced by a tenant whose DEK is wrapped by a master
    /// key older than `master_key_id`.
    async fn live_secrets_wrapped_before(
        &self,
        master_key_id: i32,
        limit: i64,
    ) -> SchedulerResult<Vec<Secret>>;

    /// Inserts `replacement` and repoints tenant references away from
    /// `old_secret_id`. Returns the number of repointed references; when that
    /// is zero nothing is written.
    async fn supersede_secret(
        &self,
        old_secret_id: &str,
        replacement: &Secret,
    ) -> SchedulerResult<u64>;
}
