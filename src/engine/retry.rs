//! Job-level retry chains.

use chrono::{DateTime, Duration, Utc};

use crate::engine::fingerprint::retry_fingerprint;
use crate::models::scheduled_job::{NewScheduledJob, ScheduledJob};
use crate::utils::id::{new_id, JOB};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::seconds(60),
            max_delay: Duration::hours(6),
        }
    }
}

impl RetryPolicy {
    /// `base * 2^attempt`, capped at `max_delay`.
    pub fn backoff(&self, attempt: i32) -> Duration {
        let exponent = attempt.clamp(0, 30) as u32;
        let factor = 1i64 << exponent;
        let millis = self.base_delay.num_milliseconds().saturating_mul(factor);
        Duration::milliseconds(millis).min(self.max_delay)
    }
}

/// The follow-up job for a failed attempt, or `None` when retries are spent.
///
/// Each hop decrements `max_retries`, so a chain starting at `n` has at most
/// `n` retries and `retry_for_id` always points at an older job.
pub fn plan_retry(
    failed: &ScheduledJob,
    executed_at: DateTime<Utc>,
    policy: &RetryPolicy,
) -> Option<NewScheduledJob> {
    if failed.max_retries <= 0 {
        return None;
    }
    let attempt = failed.attempt + 1;
    Some(NewScheduledJob {
        id: new_id(JOB),
        hash: retry_fingerprint(&failed.hash, attempt),
        tenant_id: failed.tenant_id.clone(),
        region: failed.region.clone(),
        request_id: failed.request_id.clone(),
        scheduled_at: executed_at + policy.backoff(failed.attempt),
        timeout_ms: failed.timeout_ms,
        max_retries: failed.max_retries - 1,
        max_response_bytes: failed.max_response_bytes,
        attempt,
        origin: failed.origin.clone(),
        retry_for_id: Some(failed.id.clone()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::scheduled_job::JobOrigin;

    fn job(max_retries: i32, attempt: i32) -> ScheduledJob {
        NewScheduledJob {
            id: format!("job_{}", attempt),
            hash: "h".into(),
            tenant_id: "tenant_1".into(),
            region: "eu".into(),
            request_id: "req_1".into(),
            scheduled_at: Utc::now(),
            timeout_ms: Some(1000),
            max_retries,
            max_response_bytes: None,
            attempt,
            origin: JobOrigin::OneOff("oneoff_1".into()),
            retry_for_id: None,
        }
        .into_job(Utc::now())
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            base_delay: Duration::seconds(60),
            max_delay: Duration::minutes(5),
        };
        assert_eq!(policy.backoff(0), Duration::seconds(60));
        assert_eq!(policy.backoff(1), Duration::seconds(120));
        assert_eq!(policy.backoff(2), Duration::seconds(240));
        assert_eq!(policy.backoff(3), Duration::minutes(5));
        assert_eq!(policy.backoff(500), Duration::minutes(5));
    }

    #[test]
    fn retry_links_back_and_spends_one_retry() {
        let failed = job(2, 0);
        let now = Utc::now();
        let retry = plan_retry(&failed, now, &RetryPolicy::default()).unwrap();

        assert_eq!(retry.retry_for_id.as_deref(), Some(failed.id.as_str()));
        assert_eq!(retry.max_retries, 1);
        assert_eq!(retry.attempt, 1);
        assert_eq!(retry.request_id, failed.request_id);
        assert_eq!(retry.origin, failed.origin);
        assert_eq!(retry.scheduled_at, now + Duration::seconds(60));
        assert_ne!(retry.hash, failed.hash);
    }

    #[test]
    fn chains_terminate_within_max_retries_hops() {
        let policy = RetryPolicy::default();
        let mut current = job(4, 0);
        let mut hops = 0;
        while let Some(next) = plan_retry(&current, Utc::now(), &policy) {
            assert_ne!(next.id, current.id);
            hops += 1;
            current = next.into_job(Utc::now());
        }
        assert_eq!(hops, 4);
        assert!(plan_retry(&job(0, 0), Utc::now(), &policy).is_none());
    }
}
