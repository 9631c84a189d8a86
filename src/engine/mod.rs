pub mod cron;
pub mod drone_registry;
pub mod fingerprint;
pub mod key_rotation;
pub mod lease;
pub mod orchestrator;
pub mod rate_limiter;
pub mod retention;
pub mod retry;
pub mod submission;
