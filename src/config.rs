use chrono::Duration;
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::engine::fingerprint::DedupPolicy;
use crate::engine::retry::RetryPolicy;
use crate::utils::encryption::decode_key;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Tunables for the scheduling core. Defaults match production.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// How long a heartbeat keeps a drone eligible.
    pub drone_lease_ttl: Duration,
    /// Slack added to a job's timeout before its lease may be reclaimed.
    pub lease_grace: Duration,
    pub max_lease_attempts: i32,
    pub lease_batch_size: i64,
    pub default_timeout_ms: i32,
    pub retry: RetryPolicy,
    pub workflow_retry_base: Duration,
    pub default_child_max_retries: i32,
    pub dedup_policy: DedupPolicy,
    pub dedup_window: Duration,
    pub key_rollover_window: Duration,
    pub cron_lookahead: Duration,
    pub cron_max_pending: i64,
    pub purge_grace: Duration,
    pub drone_purge_after: Duration,
    pub signature_tolerance: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            drone_lease_ttl: Duration::seconds(15),
            lease_grace: Duration::seconds(90),
            max_lease_attempts: 5,
            lease_batch_size: 16,
            default_timeout_ms: 60_000,
            retry: RetryPolicy::default(),
            workflow_retry_base: Duration::minutes(3),
            default_child_max_retries: 9,
            dedup_policy: DedupPolicy::Allow,
            dedup_window: Duration::minutes(10),
            key_rollover_window: Duration::hours(24),
            cron_lookahead: Duration::minutes(15),
            cron_max_pending: 60,
            purge_grace: Duration::hours(3),
            drone_purge_after: Duration::days(1),
            signature_tolerance: Duration::minutes(5),
        }
    }
}

impl SchedulerSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("DRONE_LEASE_TTL_SECONDS", self.drone_lease_ttl),
            ("RETRY_BASE_DELAY_SECONDS", self.retry.base_delay),
            ("KEY_ROLLOVER_WINDOW_SECONDS", self.key_rollover_window),
            ("CRON_LOOKAHEAD_SECONDS", self.cron_lookahead),
        ];
        for (name, value) in positive {
            if value <= Duration::zero() {
                return Err(ConfigError::Invalid {
                    name,
                    reason: "must be greater than zero".into(),
                });
            }
        }
        if self.lease_grace < Duration::zero() {
            return Err(ConfigError::Invalid {
                name: "LEASE_GRACE_SECONDS",
                reason: "must not be negative".into(),
            });
        }
        if self.retry.max_delay < self.retry.base_delay {
            return Err(ConfigError::Invalid {
                name: "RETRY_MAX_DELAY_SECONDS",
                reason: "must be at least RETRY_BASE_DELAY_SECONDS".into(),
            });
        }
        if self.max_lease_attempts < 1 {
            return Err(ConfigError::Invalid {
                name: "MAX_LEASE_ATTEMPTS",
                reason: "must be at least 1".into(),
            });
        }
        if self.default_timeout_ms < 1 || self.lease_batch_size < 1 || self.cron_max_pending < 1 {
            return Err(ConfigError::Invalid {
                name: "DEFAULT_TIMEOUT_MS",
                reason: "timeouts and batch sizes must be positive".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: SocketAddr,
    pub valid_regions: Vec<String>,
    pub api_auth_keys: Vec<String>,
    pub drone_auth_key: String,
    /// `(master_key_id, 32-byte key)`
    pub master_keys: Vec<(i32, Vec<u8>)>,
    pub rate_limit_ms: u64,
    pub rate_limit_burst: u32,
    pub scheduler: SchedulerSettings,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok(); // Load .env file

        let database_url = required("DATABASE_URL")?;
        let bind_addr = parse_or("BIND_ADDR", SocketAddr::from(([127, 0, 0, 1], 3000)))?;
        let valid_regions = list(&env::var("VALID_REGIONS").unwrap_or_else(|_| "local".into()));
        let api_auth_keys = list(&required("API_AUTH_KEYS")?);
        let drone_auth_key = required("DRONE_AUTH_KEY")?;
        let master_keys = parse_master_keys(&required("MASTER_KEYS")?)?;

        let defaults = SchedulerSettings::default();
        let scheduler = SchedulerSettings {
            drone_lease_ttl: seconds_or("DRONE_LEASE_TTL_SECONDS", defaults.drone_lease_ttl)?,
            lease_grace: seconds_or("LEASE_GRACE_SECONDS", defaults.lease_grace)?,
            max_lease_attempts: parse_or("MAX_LEASE_ATTEMPTS", defaults.max_lease_attempts)?,
            lease_batch_size: parse_or("LEASE_BATCH_SIZE", defaults.lease_batch_size)?,
            default_timeout_ms: parse_or("DEFAULT_TIMEOUT_MS", defaults.default_timeout_ms)?,
            retry: RetryPolicy {
                base_delay: seconds_or("RETRY_BASE_DELAY_SECONDS", defaults.retry.base_delay)?,
                max_delay: seconds_or("RETRY_MAX_DELAY_SECONDS", defaults.retry.max_delay)?,
            },
            workflow_retry_base: seconds_or(
                "WORKFLOW_RETRY_BASE_SECONDS",
                defaults.workflow_retry_base,
            )?,
            default_child_max_retries: parse_or(
                "DEFAULT_CHILD_MAX_RETRIES",
                defaults.default_child_max_retries,
            )?,
            dedup_policy: parse_or("DEDUP_POLICY", defaults.dedup_policy)?,
            dedup_window: seconds_or("DEDUP_WINDOW_SECONDS", defaults.dedup_window)?,
            key_rollover_window: seconds_or(
                "KEY_ROLLOVER_WINDOW_SECONDS",
                defaults.key_rollover_window,
            )?,
            cron_lookahead: seconds_or("CRON_LOOKAHEAD_SECONDS", defaults.cron_lookahead)?,
            cron_max_pending: parse_or("CRON_MAX_PENDING", defaults.cron_max_pending)?,
            purge_grace: seconds_or("PURGE_GRACE_SECONDS", defaults.purge_grace)?,
            drone_purge_after: seconds_or("DRONE_PURGE_AFTER_SECONDS", defaults.drone_purge_after)?,
            signature_tolerance: seconds_or(
                "SIGNATURE_TOLERANCE_SECONDS",
                defaults.signature_tolerance,
            )?,
        };

        let config = Config {
            database_url,
            bind_addr,
            valid_regions,
            api_auth_keys,
            drone_auth_key,
            master_keys,
            // Default: 200ms/token (~5 req/sec)
            rate_limit_ms: parse_or("RATE_LIMITER_MILLISECONDS", 200)?,
            rate_limit_burst: parse_or("RATE_LIMITER_BURST", 20)?,
            scheduler,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.valid_regions.is_empty() {
            return Err(ConfigError::Invalid {
                name: "VALID_REGIONS",
                reason: "at least one region is required".into(),
            });
        }
        if self.api_auth_keys.is_empty() {
            return Err(ConfigError::Missing("API_AUTH_KEYS"));
        }
        if self.master_keys.is_empty() {
            return Err(ConfigError::Missing("MASTER_KEYS"));
        }
        self.scheduler.validate()
    }

    pub fn is_valid_region(&self, region: &str) -> bool {
        self.valid_regions.iter().any(|r| r == region)
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    match env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::Missing(name)),
    }
}

fn parse_or<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
            name,
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn seconds_or(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    let secs: i64 = parse_or(name, default.num_seconds())?;
    Ok(Duration::seconds(secs))
}

fn list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// `MASTER_KEYS=1:<base64>,2:<base64>`
pub fn parse_master_keys(raw: &str) -> Result<Vec<(i32, Vec<u8>)>, ConfigError> {
    let mut keys = Vec::new();
    for entry in list(raw) {
        let (id, key) = entry.split_once(':').ok_or_else(|| ConfigError::Invalid {
            name: "MASTER_KEYS",
            reason: format!("entry {:?} is not <id>:<base64>", entry),
        })?;
        let id: i32 = id.trim().parse().map_err(|_| ConfigError::Invalid {
            name: "MASTER_KEYS",
            reason: format!("key id {:?} is not an integer", id),
        })?;
        let key = decode_key(key.trim()).map_err(|e| ConfigError::Invalid {
            name: "MASTER_KEYS",
            reason: format!("key {}: {}", id, e),
        })?;
        keys.push((id, key));
    }
    Ok(keys)
}
