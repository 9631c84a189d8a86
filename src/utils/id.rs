use uuid::Uuid;

pub const TENANT: &str = "tenant";
pub const REQUEST: &str = "req";
pub const RESPONSE: &str = "resp";
pub const JOB: &str = "job";
pub const EXECUTION: &str = "exec";
pub const ONE_OFF: &str = "oneoff";
pub const CRON: &str = "cron";
pub const WORKFLOW: &str = "wf";
pub const WORKFLOW_EXECUTION: &str = "wfexec";
pub const DEPENDENCY: &str = "wfdep";
pub const SECRET: &str = "secret";

/// Opaque identifier of the form `<prefix>_<32 hex chars>`.
pub fn new_id(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}

pub fn has_prefix(id: &str, prefix: &str) -> bool {
    id.strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('_'))
        .map(|rest| !rest.is_empty())
        .unwrap_or(false)
}
