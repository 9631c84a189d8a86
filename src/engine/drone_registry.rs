//! Drone liveness. A heartbeat keeps a drone eligible for `drone_lease_ttl`;
//! drones are told to check in again well before that runs out.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use tracing::debug;

use crate::errors::{SchedulerError, SchedulerResult};
use crate::models::drone::Drone;
use crate::state::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub drone_id: String,
    pub ip: String,
    pub region: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatAck {
    pub drone: Drone,
    pub checkin_again_at: DateTime<Utc>,
}

pub async fn heartbeat(
    state: &AppState,
    request: &HeartbeatRequest,
    now: DateTime<Utc>,
) -> SchedulerResult<HeartbeatAck> {
    if request.drone_id.trim().is_empty() {
        return Err(SchedulerError::validation("drone_id is required"));
    }
    let ip: IpAddr = request
        .ip
        .parse()
        .map_err(|_| SchedulerError::validation(format!("invalid ip address {}", request.ip)))?;
    if !state.config.is_valid_region(&request.region) {
        return Err(SchedulerError::validation(format!(
            "unknown region {}",
            request.region
        )));
    }

    let ttl = state.settings().drone_lease_ttl;
    let drone = Drone {
        id: request.drone_id.clone(),
        ip: ip.to_string(),
        region: request.region.clone(),
        last_checkin: now,
        checkin_by: now + ttl,
    };
    // Config validation keeps ttl positive, so this only trips on a bad store.
    if drone.checkin_by <= drone.last_checkin {
        return Err(SchedulerError::Corrupt(
            "heartbeat produced checkin_by <= last_checkin".into(),
        ));
    }
    let drone = state.drones.upsert_checkin(&drone).await?;
    debug!(drone_id = %drone.id, region = %drone.region, "drone checked in");

    Ok(HeartbeatAck {
        checkin_again_at: now + Duration::milliseconds(ttl.num_milliseconds() * 3 / 5),
        drone,
    })
}

pub async fn eligible_drones(state: &AppState, region: &str, now: DateTime<Utc>) -> SchedulerResult<Vec<Drone>> {
    state.drones.eligible_drones(region, now).await
}

/// The drone, if it is alive in `region`.
pub async fn ensure_eligible(
    state: &AppState,
    drone_id: &str,
    region: &str,
    now: DateTime<Utc>,
) -> SchedulerResult<Drone> {
    let not_eligible = || SchedulerError::DroneNotEligible {
        drone_id: drone_id.to_string(),
        region: region.to_string(),
    };
    let drone = state.drones.find_drone(drone_id).await?.ok_or_else(not_eligible)?;
    if drone.region != region || !drone.is_alive(now) {
        return Err(not_eligible());
    }
    Ok(drone)
}
