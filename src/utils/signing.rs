//! Request signatures that let tenants authenticate calls made by drones.
//!
//! The header value is a small JSON object: `{"t": <unix seconds>, "p": <url path>,
//! "v1": <hex HMAC-SHA256>}`. The MAC covers `.{t}.{p}` plus `.{body}` when the
//! request has one.

use axum::http::Uri;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "Relaycron-Signature";
pub const JOB_ID_HEADER: &str = "Relaycron-Job-Id";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SigningError {
    #[error("signing key is empty")]
    InvalidKey,
    #[error("request url is not absolute: {0}")]
    InvalidUrl(String),
    #[error("signature header is malformed")]
    MalformedHeader,
    #[error("signature timestamp is outside the accepted window")]
    Expired,
    #[error("signature does not match")]
    Mismatch,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignatureHeader {
    pub t: i64,
    pub p: String,
    pub v1: String,
}

/// Path component the signature is bound to.
pub fn signed_path(url: &str) -> Result<String, SigningError> {
    let uri: Uri = url
        .parse()
        .map_err(|_| SigningError::InvalidUrl(url.to_string()))?;
    if uri.scheme().is_none() || uri.authority().is_none() {
        return Err(SigningError::InvalidUrl(url.to_string()));
    }
    Ok(uri.path().to_string())
}

fn mac_hex(key: &[u8], timestamp: i64, path: &str, body: Option<&str>) -> Result<String, SigningError> {
    if key.is_empty() {
        return Err(SigningError::InvalidKey);
    }
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| SigningError::InvalidKey)?;
    mac.update(format!(".{}.{}", timestamp, path).as_bytes());
    if let Some(body) = body {
        mac.update(format!(".{}", body).as_bytes());
    }
    Ok(hex::encode(mac.finalize().into_bytes()))
}

pub fn sign(
    key: &[u8],
    at: DateTime<Utc>,
    url: &str,
    body: Option<&str>,
) -> Result<SignatureHeader, SigningError> {
    let path = signed_path(url)?;
    let t = at.timestamp();
    let v1 = mac_hex(key, t, &path, body)?;
    Ok(SignatureHeader { t, p: path, v1 })
}

pub fn signature_header_value(header: &SignatureHeader) -> String {
    serde_json::json!({ "t": header.t, "p": header.p, "v1": header.v1 }).to_string()
}

/// Checks `header` against every candidate key. Any match within `tolerance`
/// of `now` is accepted; comparison is constant time.
pub fn verify(
    keys: &[Vec<u8>],
    header: &str,
    path: &str,
    body: Option<&str>,
    now: DateTime<Utc>,
    tolerance: Duration,
) -> Result<(), SigningError> {
    let parsed: SignatureHeader =
        serde_json::from_str(header).map_err(|_| SigningError::MalformedHeader)?;
    if parsed.p != path {
        return Err(SigningError::Mismatch);
    }
    let signed_at =
        DateTime::<Utc>::from_timestamp(parsed.t, 0).ok_or(SigningError::MalformedHeader)?;
    if (now - signed_at).abs() > tolerance {
        return Err(SigningError::Expired);
    }

    let mut matched = false;
    for key in keys {
        let expected = mac_hex(key, parsed.t, &parsed.p, body)?;
        if subtle::ConstantTimeEq::ct_eq(expected.as_bytes(), parsed.v1.as_bytes()).unwrap_u8() == 1
        {
            matched = true;
        }
    }
    if matched {
        Ok(())
    } else {
        Err(SigningError::Mismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn signature_binds_path_timestamp_and_body() {
        let sig = sign(b"k1", at(), "https://api.example.com/hooks/run?x=1", Some("{}")).unwrap();
        assert_eq!(sig.p, "/hooks/run");
        assert_eq!(sig.t, 1_700_000_000);
        assert_eq!(sig.v1.len(), 64);

        let header = signature_header_value(&sig);
        let tolerance = Duration::minutes(5);
        assert!(verify(&[b"k1".to_vec()], &header, "/hooks/run", Some("{}"), at(), tolerance).is_ok());
        assert_eq!(
            verify(&[b"k1".to_vec()], &header, "/hooks/run", Some("{\"a\":1}"), at(), tolerance),
            Err(SigningError::Mismatch)
        );
        assert_eq!(
            verify(&[b"k1".to_vec()], &header, "/other", Some("{}"), at(), tolerance),
            Err(SigningError::Mismatch)
        );
    }

    #[test]
    fn either_key_verifies() {
        let sig = sign(b"next", at(), "https://x.test/cb", None).unwrap();
        let header = signature_header_value(&sig);
        let keys = vec![b"current".to_vec(), b"next".to_vec()];
        assert!(verify(&keys, &header, "/cb", None, at(), Duration::minutes(5)).is_ok());
        assert_eq!(
            verify(&keys[..1], &header, "/cb", None, at(), Duration::minutes(5)),
            Err(SigningError::Mismatch)
        );
    }

    #[test]
    fn old_signatures_and_garbage_are_rejected() {
        let sig = sign(b"k", at(), "https://x.test/cb", None).unwrap();
        let header = signature_header_value(&sig);
        let later = at() + Duration::minutes(10);
        assert_eq!(
            verify(&[b"k".to_vec()], &header, "/cb", None, later, Duration::minutes(5)),
            Err(SigningError::Expired)
        );
        assert_eq!(
            verify(&[b"k".to_vec()], "not json", "/cb", None, at(), Duration::minutes(5)),
            Err(SigningError::MalformedHeader)
        );
        assert!(matches!(sign(b"k", at(), "/relative", None), Err(SigningError::InvalidUrl(_))));
    }
}
