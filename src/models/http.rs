use axum::http::{Method, Uri};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Captured outbound request. Immutable once stored.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct HttpRequest {
    pub id: String,
    pub method: String,
    pub url: String,
    pub headers: Vec<String>,
    pub body: Option<String>,
    pub bytes_used: i32,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct HttpResponse {
    pub id: String,
    pub status: i32,
    pub headers: Vec<String>,
    pub body: String,
    pub bytes_used: i32,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Request as submitted by a tenant. Headers are `Name: value` lines.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewHttpRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: Vec<String>,
    #[serde(default)]
    pub body: Option<String>,
}

/// Response captured by a drone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewHttpResponse {
    pub status: i32,
    #[serde(default)]
    pub headers: Vec<String>,
    #[serde(default)]
    pub body: String,
}

/// Absolute http(s) URL with a host.
pub fn validate_url(url: &str) -> Result<(), String> {
    let uri: Uri = url.parse().map_err(|_| format!("invalid url {}", url))?;
    match uri.scheme_str() {
        Some("http") | Some("https") => {}
        _ => return Err("url must use http or https".into()),
    }
    if uri.host().map(str::is_empty).unwrap_or(true) {
        return Err("url must include a host".into());
    }
    Ok(())
}

fn headers_len(headers: &[String]) -> usize {
    headers.iter().map(|h| h.len()).sum()
}

fn clamp_len(len: usize) -> i32 {
    i32::try_from(len).unwrap_or(i32::MAX)
}

impl NewHttpRequest {
    pub fn body_len(&self) -> usize {
        self.body.as_deref().map(str::len).unwrap_or(0)
    }

    pub fn bytes_used(&self) -> i32 {
        clamp_len(self.method.len() + self.url.len() + headers_len(&self.headers) + self.body_len())
    }

    /// Shape checks that do not depend on tenant limits.
    pub fn validate(&self) -> Result<(), String> {
        let method: Method = self
            .method
            .to_ascii_uppercase()
            .parse()
            .map_err(|_| format!("invalid method {}", self.method))?;
        let supported = [
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::HEAD,
            Method::OPTIONS,
        ];
        if !supported.contains(&method) {
            return Err(format!("unsupported method {}", self.method));
        }

        validate_url(&self.url)?;

        for header in &self.headers {
            match header.split_once(':') {
                Some((name, _)) if !name.trim().is_empty() && !name.contains(' ') => {}
                _ => return Err(format!("malformed header {:?}", header)),
            }
        }
        Ok(())
    }

    pub fn into_request(self, id: String, now: DateTime<Utc>) -> HttpRequest {
        let bytes_used = self.bytes_used();
        HttpRequest {
            id,
            method: self.method.to_ascii_uppercase(),
            url: self.url,
            headers: self.headers,
            body: self.body,
            bytes_used,
            created_at: now,
            deleted_at: None,
        }
    }
}

impl NewHttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn into_response(self, id: String, now: DateTime<Utc>) -> HttpResponse {
        let bytes_used = clamp_len(headers_len(&self.headers) + self.body.len());
        HttpResponse {
            id,
            status: self.status,
            headers: self.headers,
            body: self.body,
            bytes_used,
            created_at: now,
            deleted_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: &str, url: &str) -> NewHttpRequest {
        NewHttpRequest {
            method: method.into(),
            url: url.into(),
            headers: vec!["Content-Type: application/json".into()],
            body: Some("{\"a\":1}".into()),
        }
    }

    #[test]
    fn bytes_used_counts_every_component() {
        let req = request("POST", "https://example.com/x");
        let expected = 4 + 21 + 30 + 7;
        assert_eq!(req.bytes_used(), expected);
        let stored = req.into_request("req_1".into(), Utc::now());
        assert_eq!(stored.bytes_used, expected);
    }

    #[test]
    fn validation_rejects_bad_shapes() {
        assert!(request("post", "https://example.com").validate().is_ok());
        assert!(request("TRACE", "https://example.com").validate().is_err());
        assert!(request("GET", "ftp://example.com").validate().is_err());
        assert!(request("GET", "/relative").validate().is_err());

        let mut bad_header = request("GET", "https://example.com");
        bad_header.headers = vec!["no colon here".into()];
        assert!(bad_header.validate().is_err());
    }

    #[test]
    fn response_success_is_2xx_only() {
        let ok = NewHttpResponse { status: 204, headers: vec![], body: String::new() };
        let redirect = NewHttpResponse { status: 302, headers: vec![], body: String::new() };
        assert!(ok.is_success());
        assert!(!redirect.is_success());
    }
}
