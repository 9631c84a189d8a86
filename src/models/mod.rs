pub mod cron_job;
pub mod drone;
pub mod http;
pub mod job_execution;
pub mod one_off_job;
pub mod scheduled_job;
pub mod secret;
pub mod tenant;
pub mod workflow;
pub mod workflow_dependency;
pub mod workflow_execution;
