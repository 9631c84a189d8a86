use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, error, info};

use crate::engine::{cron, key_rotation, lease, orchestrator, retention};
use crate::errors::SchedulerResult;
use crate::state::AppState;

const CRON_EVERY: Duration = Duration::from_secs(30);
const WORKFLOW_EVERY: Duration = Duration::from_secs(1);
const RECLAIM_EVERY: Duration = Duration::from_secs(10);
const REFILL_EVERY: Duration = Duration::from_secs(15);
const KEYS_EVERY: Duration = Duration::from_secs(60);
const RETENTION_EVERY: Duration = Duration::from_secs(300);

const WORKFLOW_BATCH: i64 = 100;
const REFILL_BATCH: i64 = 500;

pub async fn start_background_workers(state: AppState) {
    spawn_loop("cron", CRON_EVERY, state.clone(), materialize_crons);
    spawn_loop("workflows", WORKFLOW_EVERY, state.clone(), tick_workflows);
    spawn_loop("leases", RECLAIM_EVERY, state.clone(), reclaim_leases);
    spawn_loop("refill", REFILL_EVERY, state.clone(), refill_buckets);
    spawn_loop("keys", KEYS_EVERY, state.clone(), maintain_keys);
    spawn_loop("retention", RETENTION_EVERY, state, sweep_retention);
    info!("background workers started");
}

fn spawn_loop<F, Fut>(name: &'static str, every: Duration, state: AppState, pass: F)
where
    F: Fn(AppState) -> Fut + Send + 'static,
    Fut: Future<Output = SchedulerResult<()>> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            if let Err(e) = pass(state.clone()).await {
                error!(worker = name, error = %e, "background pass failed");
            }
            sleep(every).await;
        }
    });
}

async fn materialize_crons(state: AppState) -> SchedulerResult<()> {
    let summary = cron::materialize_due(&state, state.clock.now()).await?;
    if summary.scheduled > 0 || summary.rate_limited > 0 {
        info!(
            scheduled = summary.scheduled,
            rate_limited = summary.rate_limited,
            "cron occurrences materialized"
        );
    }
    Ok(())
}

async fn tick_workflows(state: AppState) -> SchedulerResult<()> {
    let ticked = orchestrator::tick_all(&state, state.clock.now(), WORKFLOW_BATCH).await?;
    if ticked > 0 {
        debug!(ticked, "workflows ticked");
    }
    Ok(())
}

async fn reclaim_leases(state: AppState) -> SchedulerResult<()> {
    let summary = lease::reclaim_expired_leases(&state, state.clock.now()).await?;
    if summary.released > 0 || summary.escalated > 0 {
        info!(
            released = summary.released,
            escalated = summary.escalated,
            "expired leases reclaimed"
        );
    }
    Ok(())
}

async fn refill_buckets(state: AppState) -> SchedulerResult<()> {
    let refilled = state.tenants.refill_due(state.clock.now(), REFILL_BATCH).await?;
    if refilled > 0 {
        debug!(refilled, "token buckets refilled");
    }
    Ok(())
}

async fn maintain_keys(state: AppState) -> SchedulerResult<()> {
    let now = state.clock.now();
    let promoted = key_rotation::promote_due_rotations(&state, now).await?;
    let rewrapped = key_rotation::rewrap_stale_secrets(&state, now).await?;
    if promoted > 0 || rewrapped > 0 {
        info!(promoted, rewrapped, "key maintenance done");
    }
    Ok(())
}

async fn sweep_retention(state: AppState) -> SchedulerResult<()> {
    let summary = retention::sweep(&state, state.clock.now()).await?;
    info!(
        soft_deleted = summary.soft_deleted,
        purged = summary.purged,
        drones_purged = summary.drones_purged,
        "retention sweep finished"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::mock_db::MockDb;
    use crate::state::test_support::harness;
    use std::sync::Arc;

    #[tokio::test]
    async fn every_pass_runs_against_a_populated_store() {
        let h = harness();
        let tenant = h.tenant().await;
        h.drone("drone-1", "eu").await;
        h.submit(&tenant.id, "eu", 1).await;

        materialize_crons(h.state.clone()).await.unwrap();
        tick_workflows(h.state.clone()).await.unwrap();
        reclaim_leases(h.state.clone()).await.unwrap();
        refill_buckets(h.state.clone()).await.unwrap();
        maintain_keys(h.state.clone()).await.unwrap();
        sweep_retention(h.state.clone()).await.unwrap();
    }

    #[tokio::test]
    async fn failures_surface_as_errors() {
        let h = harness();
        let state = AppState {
            tenants: Arc::new(MockDb::failing()),
            ..h.state.clone()
        };
        assert!(refill_buckets(state).await.is_err());
    }
}
