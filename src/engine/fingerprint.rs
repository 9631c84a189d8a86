//! Content fingerprints for scheduled jobs and the dedup policy built on them.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::models::http::HttpRequest;

/// What to do when an identical submission arrives inside the dedup window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupPolicy {
    /// Accept every submission.
    Allow,
    /// Refuse the duplicate with a conflict.
    Reject,
    /// Return the job created by the earlier submission.
    Collapse,
}

impl FromStr for DedupPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "allow" => Ok(DedupPolicy::Allow),
            "reject" => Ok(DedupPolicy::Reject),
            "collapse" => Ok(DedupPolicy::Collapse),
            other => Err(format!("unknown dedup policy {}", other)),
        }
    }
}

impl fmt::Display for DedupPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DedupPolicy::Allow => "allow",
            DedupPolicy::Reject => "reject",
            DedupPolicy::Collapse => "collapse",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupCheck {
    pub policy: DedupPolicy,
    /// Only jobs created at or after this instant count as duplicates.
    pub since: DateTime<Utc>,
}

/// Scheduling parameters that make two otherwise identical requests distinct.
#[derive(Debug, Clone, Copy)]
pub struct FingerprintParams<'a> {
    pub tenant_id: &'a str,
    pub region: &'a str,
    /// `None` for jobs that run as soon as possible.
    pub scheduled_at: Option<DateTime<Utc>>,
    pub timeout_ms: Option<i32>,
    pub max_retries: i32,
    pub max_response_bytes: Option<i32>,
}

fn field(hasher: &mut Sha256, value: &[u8]) {
    // Length prefix keeps ("ab","c") and ("a","bc") apart.
    hasher.update((value.len() as u64).to_be_bytes());
    hasher.update(value);
}

fn opt_i32(value: Option<i32>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Hex SHA-256 over the request content and scheduling parameters.
/// Header order does not matter; ids and timestamps of the stored rows do not
/// participate.
pub fn job_fingerprint(request: &HttpRequest, params: &FingerprintParams<'_>) -> String {
    let mut hasher = Sha256::new();
    field(&mut hasher, params.tenant_id.as_bytes());
    field(&mut hasher, params.region.as_bytes());
    match params.scheduled_at {
        Some(at) => field(&mut hasher, at.timestamp_millis().to_string().as_bytes()),
        None => field(&mut hasher, b"immediate"),
    }
    field(&mut hasher, opt_i32(params.timeout_ms).as_bytes());
    field(&mut hasher, params.max_retries.to_string().as_bytes());
    field(&mut hasher, opt_i32(params.max_response_bytes).as_bytes());

    field(&mut hasher, request.method.to_ascii_uppercase().as_bytes());
    field(&mut hasher, request.url.as_bytes());
    let mut headers: Vec<&String> = request.headers.iter().collect();
    headers.sort();
    for header in headers {
        field(&mut hasher, header.as_bytes());
    }
    match &request.body {
        Some(body) => field(&mut hasher, body.as_bytes()),
        None => hasher.update([0xff]),
    }
    hex::encode(hasher.finalize())
}

/// Fingerprint of the `attempt`-th retry of a job.
pub fn retry_fingerprint(parent_hash: &str, attempt: i32) -> String {
    let mut hasher = Sha256::new();
    field(&mut hasher, parent_hash.as_bytes());
    field(&mut hasher, attempt.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn request(headers: Vec<&str>, body: Option<&str>) -> HttpRequest {
        HttpRequest {
            id: "req_a".into(),
            method: "POST".into(),
            url: "https://example.com/hook".into(),
            headers: headers.into_iter().map(String::from).collect(),
            body: body.map(String::from),
            bytes_used: 0,
            created_at: Utc::now(),
            deleted_at: None,
        }
    }

    fn params(at: i64) -> FingerprintParams<'static> {
        FingerprintParams {
            tenant_id: "tenant_1",
            region: "eu",
            scheduled_at: Some(Utc.timestamp_opt(at, 0).unwrap()),
            timeout_ms: None,
            max_retries: 3,
            max_response_bytes: None,
        }
    }

    #[test]
    fn identical_content_hashes_identically_regardless_of_ids_and_header_order() {
        let a = request(vec!["A: 1", "B: 2"], Some("{}"));
        let mut b = request(vec!["B: 2", "A: 1"], Some("{}"));
        b.id = "req_b".into();
        assert_eq!(job_fingerprint(&a, &params(10)), job_fingerprint(&b, &params(10)));
    }

    #[test]
    fn scheduling_parameters_and_body_change_the_hash() {
        let a = request(vec![], Some("{}"));
        let base = job_fingerprint(&a, &params(10));
        assert_ne!(base, job_fingerprint(&a, &params(11)));
        assert_ne!(base, job_fingerprint(&request(vec![], None), &params(10)));
        assert_ne!(base, job_fingerprint(&request(vec![], Some("")), &params(10)));

        let mut other_region = params(10);
        other_region.region = "us";
        assert_ne!(base, job_fingerprint(&a, &other_region));
    }

    #[test]
    fn immediate_jobs_hash_apart_from_timed_ones() {
        let a = request(vec![], Some("{}"));
        let mut immediate = params(10);
        immediate.scheduled_at = None;
        assert_eq!(job_fingerprint(&a, &immediate), job_fingerprint(&a, &immediate));
        assert_ne!(job_fingerprint(&a, &immediate), job_fingerprint(&a, &params(10)));
    }

    #[test]
    fn retries_get_distinct_hashes() {
        assert_ne!(retry_fingerprint("abc", 1), retry_fingerprint("abc", 2));
        assert_eq!(retry_fingerprint("abc", 1).len(), 64);
    }

    #[test]
    fn dedup_policy_parses_case_insensitively() {
        assert_eq!("Collapse".parse::<DedupPolicy>(), Ok(DedupPolicy::Collapse));
        assert!("sometimes".parse::<DedupPolicy>().is_err());
    }
}
