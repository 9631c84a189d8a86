use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::drone_repository::DroneRepository;
use crate::errors::SchedulerResult;
use crate::models::drone::Drone;

pub struct PostgresDroneRepository {
    pub pool: PgPool,
}

#[async_trait]
impl DroneRepository for PostgresDroneRepository {
    async fn upsert_checkin(&self, drone: &Drone) -> SchedulerResult<Drone> {
        let stored = sqlx::query_as::<_, Drone>(
            r#"
            INSERT INTO drones (id, ip, region, last_checkin, checkin_by)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE
            SET ip = EXCLUDED.ip,
                region = EXCLUDED.region,
                last_checkin = EXCLUDED.last_checkin,
                checkin_by = EXCLUDED.checkin_by
            RETURNING id, ip, region, last_checkin, checkin_by
            "#,
        )
        .bind(&drone.id)
        .bind(&drone.ip)
        .bind(&drone.region)
        .bind(drone.last_checkin)
        .bind(drone.checkin_by)
        .fetch_one(&self.pool)
        .await?;
        Ok(stored)
    }

    async fn find_drone(&self, drone_id: &str) -> SchedulerResult<Option<Drone>> {
        Ok(sqlx::query_as::<_, Drone>(
            "SELECT id, ip, region, last_checkin, checkin_by FROM drones WHERE id = $1",
        )
        .bind(drone_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn eligible_drones(&self, region: &str, now: DateTime<Utc>) -> SchedulerResult<Vec<Drone>> {
        Ok(sqlx::query_as::<_, Drone>(
            r#"
            SELECT id, ip, region, last_checkin, checkin_by
            FROM drones
            WHERE region = $1 AND checkin_by > $2
            ORDER BY id
            "#,
        )
        .bind(region)
        .bind(now)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn purge_silent(&self, silent_since: DateTime<Utc>) -> SchedulerResult<u64> {
        let result = sqlx::query("DELETE FROM drones WHERE checkin_by < $1")
            .bind(silent_since)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
