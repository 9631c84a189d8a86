//! Per-tenant token bucket gating admission of new scheduled work.
//!
//! The bucket is a plain value: repositories load it under a row lock (or the
//! in-memory store mutex), call [`TokenBucket::admit`] with the caller's `now`
//! and write it back in the same transaction.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{SchedulerError, SchedulerResult};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;
/// Refill periods shorter than this are coalesced into larger increments.
pub const MIN_PERIOD_MS: i64 = 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exhausted {
    pub retry_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBucket {
    tokens: i32,
    max_tokens: i32,
    increment: i32,
    period_ms: i64,
    next_increment: DateTime<Utc>,
}

/// Derives `(increment, period_ms)` for a daily budget so that the period is
/// never shorter than [`MIN_PERIOD_MS`].
pub fn increment_for_daily_budget(tokens_per_day: i32) -> Result<(i32, i64), String> {
    if tokens_per_day <= 0 {
        return Err("tokens_per_day must be positive".into());
    }
    let base_period = (DAY_MS / tokens_per_day as i64).max(1);
    let factor = (MIN_PERIOD_MS + base_period - 1) / base_period;
    let increment = i32::try_from(factor).map_err(|_| "tokens_per_day is too large".to_string())?;
    Ok((increment, base_period * factor))
}

impl TokenBucket {
    /// A full bucket whose first refill is one period after `now`.
    pub fn new(
        max_tokens: i32,
        increment: i32,
        period: Duration,
        now: DateTime<Utc>,
    ) -> Result<Self, String> {
        let period_ms = period.num_milliseconds();
        Self::from_parts(max_tokens, max_tokens, increment, period_ms, now + period)
    }

    pub fn for_daily_budget(
        tokens_per_day: i32,
        max_tokens: i32,
        now: DateTime<Utc>,
    ) -> Result<Self, String> {
        let (increment, period_ms) = increment_for_daily_budget(tokens_per_day)?;
        Self::new(max_tokens, increment, Duration::milliseconds(period_ms), now)
    }

    /// Rebuilds a bucket from stored columns, rejecting impossible states.
    pub fn from_parts(
        tokens: i32,
        max_tokens: i32,
        increment: i32,
        period_ms: i64,
        next_increment: DateTime<Utc>,
    ) -> Result<Self, String> {
        if max_tokens <= 0 {
            return Err("max_tokens must be positive".into());
        }
        if increment <= 0 {
            return Err("increment must be positive".into());
        }
        if period_ms <= 0 {
            return Err("period must be positive".into());
        }
        if !(0..=max_tokens).contains(&tokens) {
            return Err(format!("tokens {} outside 0..={}", tokens, max_tokens));
        }
        Ok(Self {
            tokens,
            max_tokens,
            increment,
            period_ms,
            next_increment,
        })
    }

    pub fn tokens(&self) -> i32 {
        self.tokens
    }

    pub fn max_tokens(&self) -> i32 {
        self.max_tokens
    }

    pub fn increment(&self) -> i32 {
        self.increment
    }

    pub fn period_ms(&self) -> i64 {
        self.period_ms
    }

    pub fn next_increment(&self) -> DateTime<Utc> {
        self.next_increment
    }

    /// Credits every period that has elapsed by `now`. Returns whether anything changed.
    ///
    /// Afterwards `next_increment > now` and `tokens <= max_tokens`.
    pub fn refill(&mut self, now: DateTime<Utc>) -> bool {
        if now < self.next_increment {
            return false;
        }
        let elapsed_ms = (now - self.next_increment).num_milliseconds();
        let periods = elapsed_ms / self.period_ms + 1;

        let credited = (self.increment as i64).saturating_mul(periods);
        let tokens = (self.tokens as i64).saturating_add(credited);
        self.tokens = tokens.min(self.max_tokens as i64) as i32;
        self.next_increment += Duration::milliseconds(self.period_ms.saturating_mul(periods));
        true
    }

    /// Refills, then takes `cost` tokens or reports when the next refill lands.
    pub fn admit(&mut self, cost: i32, now: DateTime<Utc>) -> Result<(), Exhausted> {
        self.refill(now);
        if cost <= 0 {
            return Ok(());
        }
        if self.tokens >= cost {
            self.tokens -= cost;
            return Ok(());
        }
        Err(Exhausted {
            retry_at: self.next_increment,
        })
    }
}

/// Admission as the stores perform it: cost validation, then [`TokenBucket::admit`].
/// The caller persists `bucket` only on success.
pub fn admit_tenant(
    bucket: &mut TokenBucket,
    tenant_id: &str,
    cost: i32,
    now: DateTime<Utc>,
) -> SchedulerResult<()> {
    if cost <= 0 || cost > bucket.max_tokens {
        return Err(SchedulerError::validation(format!(
            "admission cost {} outside 1..={}",
            cost, bucket.max_tokens
        )));
    }
    bucket
        .admit(cost, now)
        .map_err(|Exhausted { retry_at }| SchedulerError::RateLimited {
            tenant_id: tenant_id.to_string(),
            retry_at,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_opt(1_767_225_600, 0).unwrap()
    }

    fn bucket(tokens: i32, max: i32, increment: i32, period_s: i64) -> TokenBucket {
        TokenBucket::from_parts(
            tokens,
            max,
            increment,
            period_s * 1000,
            t0() + Duration::seconds(period_s),
        )
        .unwrap()
    }

    #[test]
    fn third_submission_is_limited_until_the_next_period() {
        let mut b = bucket(2, 2, 1, 60);

        assert!(b.admit(1, t0()).is_ok());
        assert!(b.admit(1, t0()).is_ok());
        let denied = b.admit(1, t0()).unwrap_err();
        assert_eq!(denied.retry_at, t0() + Duration::seconds(60));
        assert_eq!(b.tokens(), 0);

        assert!(b.admit(1, t0() + Duration::seconds(60)).is_ok());
        assert_eq!(b.tokens(), 0);
        assert_eq!(b.next_increment(), t0() + Duration::seconds(120));
    }

    #[test]
    fn refill_catches_up_over_many_periods_without_overflowing() {
        let mut b = bucket(0, 5, 2, 60);
        assert!(b.refill(t0() + Duration::minutes(30)));
        assert_eq!(b.tokens(), 5);
        assert!(b.next_increment() > t0() + Duration::minutes(30));
        assert_eq!(b.next_increment(), t0() + Duration::minutes(31));
    }

    #[test]
    fn refill_before_next_increment_is_a_no_op() {
        let mut b = bucket(1, 5, 2, 60);
        assert!(!b.refill(t0() + Duration::seconds(59)));
        assert_eq!(b.tokens(), 1);
    }

    #[test]
    fn tokens_stay_within_bounds_for_arbitrary_sequences() {
        let mut b = bucket(3, 3, 2, 45);
        let mut now = t0();
        let mut seed: u64 = 0x9e37_79b9_7f4a_7c15;
        for _ in 0..2_000 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let step = (seed >> 33) % 40;
            now += Duration::seconds(step as i64);
            if seed % 3 == 0 {
                b.refill(now);
            } else {
                let _ = b.admit(1 + (seed % 2) as i32, now);
            }
            assert!(b.tokens() >= 0 && b.tokens() <= b.max_tokens());
            assert!(b.next_increment() > now);
        }
    }

    #[test]
    fn daily_budget_never_uses_sub_minute_periods() {
        assert_eq!(increment_for_daily_budget(24).unwrap(), (1, 3_600_000));
        assert_eq!(increment_for_daily_budget(1440).unwrap(), (1, 60_000));
        let (increment, period) = increment_for_daily_budget(86_400).unwrap();
        assert_eq!((increment, period), (60, 60_000));
        assert!(increment_for_daily_budget(0).is_err());
    }

    #[test]
    fn impossible_stored_states_are_rejected() {
        assert!(TokenBucket::from_parts(6, 5, 1, 1000, t0()).is_err());
        assert!(TokenBucket::from_parts(-1, 5, 1, 1000, t0()).is_err());
        assert!(TokenBucket::from_parts(1, 5, 0, 1000, t0()).is_err());
        assert!(TokenBucket::from_parts(1, 5, 1, 0, t0()).is_err());
    }

    #[test]
    fn admit_tenant_validates_cost_and_reports_retry_at() {
        let mut b = bucket(1, 2, 1, 60);
        assert!(matches!(
            admit_tenant(&mut b, "tenant_a", 0, t0()),
            Err(SchedulerError::Validation(_))
        ));
        assert!(matches!(
            admit_tenant(&mut b, "tenant_a", 3, t0()),
            Err(SchedulerError::Validation(_))
        ));
        admit_tenant(&mut b, "tenant_a", 1, t0()).unwrap();
        match admit_tenant(&mut b, "tenant_a", 1, t0()) {
            Err(SchedulerError::RateLimited { tenant_id, retry_at }) => {
                assert_eq!(tenant_id, "tenant_a");
                assert_eq!(retry_at, b.next_increment());
            }
            other => panic!("expected rate limit, got {:?}", other),
        }
    }
}
