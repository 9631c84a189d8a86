use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::SchedulerResult;
use crate::models::drone::Drone;

#[async_trait]
pub trait DroneRepository: Send + Sync {
    async fn upsert_checkin(&self, drone: &Drone) -> SchedulerResult<Drone>;

    async fn find_drone(&self, drone_id: &str) -> SchedulerResult<Option<Drone>>;

    async fn eligible_drones(&self, region: &str, now: DateTime<Utc>) -> SchedulerResult<Vec<Drone>>;

    /// Deletes drones whose `checkin_by` passed before `silent_since`.
    async fn purge_silent(&self, silent_since: DateTime<Utc>) -> SchedulerResult<u64>;
}
