use std::sync::Arc;

use crate::clock::Clock;
use crate::config::{Config, SchedulerSettings};
use crate::db::{
    cron_repository::CronRepository, drone_repository::DroneRepository,
    job_repository::JobRepository, secret_repository::SecretRepository,
    tenant_repository::TenantRepository, workflow_repository::WorkflowRepository,
};
use crate::utils::encryption::EnvelopeCipher;

#[derive(Clone)]
pub struct AppState {
    pub tenants: Arc<dyn TenantRepository>,
    pub jobs: Arc<dyn JobRepository>,
    pub crons: Arc<dyn CronRepository>,
    pub drones: Arc<dyn DroneRepository>,
    pub workflows: Arc<dyn WorkflowRepository>,
    pub secrets: Arc<dyn SecretRepository>,
    pub cipher: Arc<dyn EnvelopeCipher>,
    pub clock: Arc<dyn Clock>,
    pub config: Arc<Config>,
}

impl AppState {
    /// Wires every repository handle to one backing store.
    pub fn from_store<S>(
        store: Arc<S>,
        cipher: Arc<dyn EnvelopeCipher>,
        clock: Arc<dyn Clock>,
        config: Arc<Config>,
    ) -> Self
    where
        S: TenantRepository
            + JobRepository
            + CronRepository
            + DroneRepository
            + WorkflowRepository
            + SecretRepository
            + 'static,
    {
        Self {
            tenants: store.clone(),
            jobs: store.clone(),
            crons: store.clone(),
            drones: store.clone(),
            workflows: store.clone(),
            secrets: store,
            cipher,
            clock,
            config,
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.config.scheduler
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use crate::clock::FakeClock;
    use crate::db::mock_db::MockDb;
    use crate::engine::drone_registry::{self, HeartbeatRequest};
    use crate::engine::submission;
    use crate::models::http::NewHttpRequest;
    use crate::models::one_off_job::NewOneOffJob;
    use crate::models::scheduled_job::ScheduledJob;
    use crate::models::tenant::{NewTenant, Tenant, TenantLimits};
    use crate::utils::encryption::KeyRing;
    use std::net::SocketAddr;

    pub const API_KEY: &str = "test-api-key";
    pub const DRONE_KEY: &str = "test-drone-key";

    pub fn test_config() -> Config {
        Config {
            database_url: "postgres://localhost/test".into(),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            valid_regions: vec!["eu".into(), "us".into()],
            api_auth_keys: vec![API_KEY.into()],
            drone_auth_key: DRONE_KEY.into(),
            master_keys: vec![(1, vec![1u8; 32])],
            rate_limit_ms: 200,
            rate_limit_burst: 20,
            scheduler: SchedulerSettings::default(),
        }
    }

    pub fn request(url: &str) -> NewHttpRequest {
        NewHttpRequest {
            method: "POST".into(),
            url: url.into(),
            headers: vec!["Content-Type: application/json".into()],
            body: None,
        }
    }

    pub struct TestHarness {
        pub state: AppState,
        pub db: Arc<MockDb>,
        pub clock: FakeClock,
    }

    pub fn harness_with(config: Config) -> TestHarness {
        let db = Arc::new(MockDb::default());
        let clock = FakeClock::default();
        let cipher = Arc::new(KeyRing::new(config.master_keys.clone()).unwrap());
        let state = AppState::from_store(
            db.clone(),
            cipher,
            Arc::new(clock.clone()),
            Arc::new(config),
        );
        TestHarness { state, db, clock }
    }

    pub fn harness() -> TestHarness {
        harness_with(test_config())
    }

    impl TestHarness {
        /// Tenant with a roomy bucket and default limits.
        pub async fn tenant(&self) -> Tenant {
            self.tenant_with(100, TenantLimits::default()).await
        }

        pub async fn tenant_with(&self, max_tokens: i32, limits: TenantLimits) -> Tenant {
            submission::create_tenant(
                &self.state,
                NewTenant {
                    tokens_per_day: 1440,
                    max_tokens,
                    limits: Some(limits),
                    default_retries: Some(3),
                },
                self.clock.now(),
            )
            .await
            .unwrap()
        }

        /// Heartbeats `drone_id` into `region` at the current fake time.
        pub async fn drone(&self, drone_id: &str, region: &str) {
            drone_registry::heartbeat(
                &self.state,
                &HeartbeatRequest {
                    drone_id: drone_id.into(),
                    ip: "10.0.0.1".into(),
                    region: region.into(),
                },
                self.clock.now(),
            )
            .await
            .unwrap();
        }

        /// A one-off job due now.
        pub async fn submit(&self, tenant_id: &str, region: &str, max_retries: i32) -> ScheduledJob {
            submission::submit_one_off(
                &self.state,
                tenant_id,
                NewOneOffJob {
                    region: region.into(),
                    execute_at: None,
                    request: request("https://tenant.test/hook"),
                    timeout_ms: None,
                    max_retries: Some(max_retries),
                    max_response_bytes: None,
                },
                self.clock.now(),
            )
            .await
            .unwrap()
            .job()
            .clone()
        }
    }
}
