//! Cron schedules and the materializer that turns them into scheduled jobs.
//!
//! Schedules accept standard 5-field Unix expressions (minute precision) or
//! 6-field expressions with seconds. Occurrences are materialized up to
//! `cron_lookahead` ahead of now, and a cron job never has more than
//! `cron_max_pending` unexecuted jobs at once.

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use std::str::FromStr;
use tracing::{debug, info, warn};

use crate::db::cron_repository::CronTick;
use crate::engine::fingerprint::{job_fingerprint, FingerprintParams};
use crate::errors::{SchedulerError, SchedulerResult};
use crate::models::cron_job::CronJob;
use crate::models::scheduled_job::{JobOrigin, NewScheduledJob};
use crate::state::AppState;
use crate::utils::id::{new_id, JOB};

/// Most occurrences materialized for one cron job in one pass.
const MAX_OCCURRENCES_PER_PASS: i64 = 60;

/// `cron` wants a seconds field; 5-field expressions run at second 0.
fn normalize(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {}", expr.trim())
    } else {
        expr.trim().to_string()
    }
}

pub fn parse_schedule(expr: &str) -> Result<Schedule, String> {
    Schedule::from_str(&normalize(expr))
        .map_err(|e| format!("invalid cron expression '{}': {}", expr, e))
}

/// Occurrences strictly after `after` and no later than `until`.
pub fn occurrences(
    schedule: &Schedule,
    after: DateTime<Utc>,
    until: DateTime<Utc>,
    limit: usize,
) -> Vec<DateTime<Utc>> {
    schedule
        .after(&after)
        .take_while(|t| *t <= until)
        .take(limit)
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaterializeSummary {
    pub scheduled: usize,
    pub rate_limited: usize,
}

/// One materializer pass over every cron job that is behind the lookahead horizon.
pub async fn materialize_due(state: &AppState, now: DateTime<Utc>) -> SchedulerResult<MaterializeSummary> {
    let horizon = now + state.settings().cron_lookahead;
    let crons = state.crons.cron_jobs_needing_ticks(horizon, 100).await?;

    let mut summary = MaterializeSummary::default();
    for cron in crons {
        match materialize_cron(state, &cron, now, horizon).await {
            Ok(s) => {
                summary.scheduled += s.scheduled;
                summary.rate_limited += s.rate_limited;
            }
            Err(e) => warn!(cron_id = %cron.id, error = %e, "cron materialization failed"),
        }
    }
    if summary.scheduled > 0 || summary.rate_limited > 0 {
        info!(
            scheduled = summary.scheduled,
            rate_limited = summary.rate_limited,
            "cron occurrences materialized"
        );
    }
    Ok(summary)
}

async fn materialize_cron(
    state: &AppState,
    cron: &CronJob,
    now: DateTime<Utc>,
    horizon: DateTime<Utc>,
) -> SchedulerResult<MaterializeSummary> {
    let mut summary = MaterializeSummary::default();
    let schedule = match parse_schedule(&cron.schedule) {
        Ok(schedule) => schedule,
        Err(e) => {
            warn!(cron_id = %cron.id, error = %e, "disabling cron job");
            state.crons.mark_cron_error(&cron.id, &e).await?;
            return Ok(summary);
        }
    };

    let pending = state.crons.pending_count(&cron.id).await?;
    let room = (state.settings().cron_max_pending - pending).min(MAX_OCCURRENCES_PER_PASS);
    if room <= 0 {
        debug!(cron_id = %cron.id, pending, "cron job has enough pending jobs");
        return Ok(summary);
    }

    let request = state
        .jobs
        .find_request(&cron.request_id)
        .await?
        .ok_or(SchedulerError::NotFound("request"))?;

    // Occurrences in the past are not back-filled.
    let floor = now - Duration::seconds(1);
    let after = cron.last_scheduled_at.map_or(floor, |last| last.max(floor));

    for scheduled_at in occurrences(&schedule, after, horizon, room as usize) {
        let hash = job_fingerprint(
            &request,
            &FingerprintParams {
                tenant_id: &cron.tenant_id,
                region: &cron.region,
                scheduled_at: Some(scheduled_at),
                timeout_ms: cron.timeout_ms,
                max_retries: cron.max_retries,
                max_response_bytes: cron.max_response_bytes,
            },
        );
        let job = NewScheduledJob {
            id: new_id(JOB),
            hash,
            tenant_id: cron.tenant_id.clone(),
            region: cron.region.clone(),
            request_id: cron.request_id.clone(),
            scheduled_at,
            timeout_ms: cron.timeout_ms,
            max_retries: cron.max_retries,
            max_response_bytes: cron.max_response_bytes,
            attempt: 0,
            origin: JobOrigin::Cron(cron.id.clone()),
            retry_for_id: None,
        };

        match state.crons.schedule_occurrence(&cron.id, &job, now).await? {
            CronTick::Scheduled(_) => summary.scheduled += 1,
            CronTick::RateLimited { retry_at } => {
                summary.rate_limited += 1;
                debug!(cron_id = %cron.id, %scheduled_at, %retry_at, "cron occurrence skipped");
            }
            CronTick::AlreadyScheduled => break,
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::engine::submission;
    use crate::models::cron_job::NewCronJob;
    use crate::models::tenant::TenantLimits;
    use crate::engine::lease::{self, ExecutionReport, ReportedResult};
    use crate::state::test_support::{harness, harness_with, request, test_config, TestHarness};

    async fn every_five_minutes(h: &TestHarness, tenant_id: &str) -> CronJob {
        submission::create_cron_job(
            &h.state,
            tenant_id,
            NewCronJob {
                region: "eu".into(),
                schedule: "*/5 * * * *".into(),
                request: request("https://tenant.test/tick"),
                timeout_ms: None,
                max_retries: None,
                max_response_bytes: None,
            },
            h.clock.now(),
        )
        .await
        .unwrap()
    }

    #[test]
    fn five_field_expressions_gain_a_seconds_field() {
        assert_eq!(normalize("*/5 * * * *"), "0 */5 * * * *");
        assert_eq!(normalize("0 0 * * * *"), "0 0 * * * *");
        assert!(parse_schedule("not a schedule").is_err());
    }

    #[test]
    fn occurrences_are_strictly_after_and_bounded() {
        let schedule = parse_schedule("*/5 * * * *").unwrap();
        let start = DateTime::<Utc>::from_timestamp(1_767_225_600, 0).unwrap();
        let times = occurrences(&schedule, start, start + Duration::minutes(15), 10);
        assert_eq!(
            times,
            vec![
                start + Duration::minutes(5),
                start + Duration::minutes(10),
                start + Duration::minutes(15)
            ]
        );
        assert_eq!(occurrences(&schedule, start, start + Duration::hours(1), 2).len(), 2);
    }

    #[tokio::test]
    async fn materializes_the_lookahead_window_once() {
        let h = harness();
        let tenant = h.tenant().await;
        let cron = every_five_minutes(&h, &tenant.id).await;

        let summary = materialize_due(&h.state, h.clock.now()).await.unwrap();
        assert_eq!(summary.scheduled, 4);
        assert_eq!(h.state.crons.pending_count(&cron.id).await.unwrap(), 4);

        let again = materialize_due(&h.state, h.clock.now()).await.unwrap();
        assert_eq!(again, MaterializeSummary::default());

        let stored = h.state.crons.find_cron_job(&cron.id).await.unwrap().unwrap();
        assert_eq!(stored.last_scheduled_at, Some(h.clock.now() + Duration::minutes(15)));
    }

    #[tokio::test]
    async fn rate_limited_occurrences_are_skipped_not_retried() {
        let h = harness();
        let tenant = h.tenant_with(2, TenantLimits::default()).await;
        let cron = every_five_minutes(&h, &tenant.id).await;

        let summary = materialize_due(&h.state, h.clock.now()).await.unwrap();
        assert_eq!(summary, MaterializeSummary { scheduled: 2, rate_limited: 2 });
        let stored = h.state.crons.find_cron_job(&cron.id).await.unwrap().unwrap();
        assert_eq!(stored.last_scheduled_at, Some(h.clock.now() + Duration::minutes(15)));
    }

    #[tokio::test]
    async fn deleted_cron_jobs_stop_materializing() {
        let h = harness();
        let tenant = h.tenant().await;
        let cron = every_five_minutes(&h, &tenant.id).await;
        materialize_due(&h.state, h.clock.now()).await.unwrap();

        submission::delete_cron_job(&h.state, &tenant.id, &cron.id, h.clock.now())
            .await
            .unwrap();
        assert_eq!(h.state.crons.pending_count(&cron.id).await.unwrap(), 0);

        h.clock.advance(Duration::hours(1));
        let summary = materialize_due(&h.state, h.clock.now()).await.unwrap();
        assert_eq!(summary.scheduled, 0);
    }

    #[tokio::test]
    async fn retry_landing_on_a_materialized_occurrence_is_recorded() {
        let mut config = test_config();
        config.scheduler.retry.base_delay = Duration::minutes(5);
        let h = harness_with(config);
        let tenant = h.tenant().await;
        let cron = every_five_minutes(&h, &tenant.id).await;
        materialize_due(&h.state, h.clock.now()).await.unwrap();

        h.clock.advance(Duration::minutes(5));
        h.drone("drone-1", "eu").await;
        let leased = lease::lease_next(&h.state, "drone-1", "eu", h.clock.now())
            .await
            .unwrap()
            .unwrap();

        let recorded = lease::report(
            &h.state,
            &ExecutionReport {
                job_id: leased.job_id.clone(),
                lock_nonce: leased.lock_nonce,
                drone_id: "drone-1".into(),
                executed_at: h.clock.now(),
                result: ReportedResult::Error("connection reset".into()),
            },
        )
        .await
        .unwrap();

        let retry = recorded.retry.unwrap();
        assert_eq!(retry.scheduled_at, h.clock.now() + Duration::minutes(5));
        assert_eq!(retry.origin, JobOrigin::Cron(cron.id.clone()));
        let executed = h.state.jobs.find_job(&leased.job_id).await.unwrap().unwrap();
        assert!(executed.is_executed());
    }
}
