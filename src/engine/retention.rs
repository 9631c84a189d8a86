//! Retention reaper: soft delete, then purge after a grace period.

use chrono::{DateTime, Utc};
use tracing::info;

use crate::errors::SchedulerResult;
use crate::state::AppState;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionSummary {
    pub soft_deleted: u64,
    pub purged: u64,
    pub drones_purged: u64,
}

pub async fn sweep(state: &AppState, now: DateTime<Utc>) -> SchedulerResult<RetentionSummary> {
    let settings = state.settings();
    let summary = RetentionSummary {
        soft_deleted: state.jobs.soft_delete_expired(now).await?,
        purged: state.jobs.purge_deleted(now - settings.purge_grace).await?,
        drones_purged: state.drones.purge_silent(now - settings.drone_purge_after).await?,
    };
    if summary != RetentionSummary::default() {
        info!(
            soft_deleted = summary.soft_deleted,
            purged = summary.purged,
            drones_purged = summary.drones_purged,
            "retention sweep"
        );
    }
    Ok(summary)
}
