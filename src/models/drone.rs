use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A worker process. Eligible while `checkin_by` is in the future.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq, Eq)]
pub struct Drone {
    pub id: String,
    pub ip: String,
    pub region: String,
    pub last_checkin: DateTime<Utc>,
    pub checkin_by: DateTime<Utc>,
}

impl Drone {
    pub fn is_alive(&self, now: DateTime<Utc>) -> bool {
        self.checkin_by > now
    }
}
