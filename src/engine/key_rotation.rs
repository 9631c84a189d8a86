//! Tenant signing keys and master-key re-wrapping.
//!
//! A tenant holds either no signing keys or exactly two. `current` signs
//! outgoing requests; `current` and `next` both verify, so a tenant can roll
//! its verifier before the keys swap.
//!
//! ```text
//! Unprovisioned --provision--> Dual --rotate--> Rolling --promote (at promote_at)--> Dual
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::{SchedulerError, SchedulerResult};
use crate::models::secret::Secret;
use crate::models::tenant::Tenant;
use crate::state::AppState;
use crate::utils::encryption::EnvelopeCipher;
use crate::utils::id::{new_id, SECRET};
use crate::utils::signing;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SigningKeys {
    Unprovisioned,
    Dual {
        current: String,
        next: String,
    },
    /// Rotation requested: `next` was freshly generated and becomes `current`
    /// at `promote_at`.
    Rolling {
        current: String,
        next: String,
        promote_at: DateTime<Utc>,
    },
}

impl SigningKeys {
    pub fn from_columns(
        current: Option<String>,
        next: Option<String>,
        promote_at: Option<DateTime<Utc>>,
    ) -> Result<Self, String> {
        match (current, next, promote_at) {
            (None, None, None) => Ok(SigningKeys::Unprovisioned),
            (Some(current), Some(next), None) => Ok(SigningKeys::Dual { current, next }),
            (Some(current), Some(next), Some(promote_at)) => Ok(SigningKeys::Rolling {
                current,
                next,
                promote_at,
            }),
            _ => Err("signing keys must be absent or come in pairs".into()),
        }
    }

    /// `(current_signing_key, next_signing_key, signing_promote_at)`
    pub fn columns(&self) -> (Option<&str>, Option<&str>, Option<DateTime<Utc>>) {
        match self {
            SigningKeys::Unprovisioned => (None, None, None),
            SigningKeys::Dual { current, next } => (Some(current.as_str()), Some(next.as_str()), None),
            SigningKeys::Rolling {
                current,
                next,
                promote_at,
            } => (Some(current.as_str()), Some(next.as_str()), Some(*promote_at)),
        }
    }

    pub fn signing_key(&self) -> Option<&str> {
        self.columns().0
    }

    pub fn verification_keys(&self) -> Vec<&str> {
        let (current, next, _) = self.columns();
        current.into_iter().chain(next).collect()
    }

    pub fn provision(&self, current: String, next: String) -> SchedulerResult<Self> {
        match self {
            SigningKeys::Unprovisioned => Ok(SigningKeys::Dual { current, next }),
            _ => Err(SchedulerError::Conflict(
                "signing keys are already provisioned".into(),
            )),
        }
    }

    pub fn begin_rotation(&self, fresh_next: String, promote_at: DateTime<Utc>) -> SchedulerResult<Self> {
        match self {
            SigningKeys::Dual { current, .. } => Ok(SigningKeys::Rolling {
                current: current.clone(),
                next: fresh_next,
                promote_at,
            }),
            SigningKeys::Unprovisioned => Err(SchedulerError::Conflict(
                "signing keys are not provisioned".into(),
            )),
            SigningKeys::Rolling { .. } => Err(SchedulerError::Conflict(
                "a signing key rotation is already in progress".into(),
            )),
        }
    }

    pub fn is_promotion_due(&self, now: DateTime<Utc>) -> bool {
        matches!(self, SigningKeys::Rolling { promote_at, .. } if *promote_at <= now)
    }

    pub fn promote(&self, fresh_next: String, now: DateTime<Utc>) -> SchedulerResult<Self> {
        match self {
            SigningKeys::Rolling { next, promote_at, .. } if *promote_at <= now => {
                Ok(SigningKeys::Dual {
                    current: next.clone(),
                    next: fresh_next,
                })
            }
            _ => Err(SchedulerError::Conflict("no promotion is due".into())),
        }
    }

    /// Same state with `old` swapped for `new` wherever it is referenced.
    pub fn replace_secret(&self, old: &str, new: &str) -> Self {
        let swap = |id: &String| if id == old { new.to_string() } else { id.clone() };
        match self {
            SigningKeys::Unprovisioned => SigningKeys::Unprovisioned,
            SigningKeys::Dual { current, next } => SigningKeys::Dual {
                current: swap(current),
                next: swap(next),
            },
            SigningKeys::Rolling {
                current,
                next,
                promote_at,
            } => SigningKeys::Rolling {
                current: swap(current),
                next: swap(next),
                promote_at: *promote_at,
            },
        }
    }
}

/// Generates fresh signing key material and seals it.
pub fn generate_signing_secret(
    cipher: &dyn EnvelopeCipher,
    now: DateTime<Utc>,
) -> SchedulerResult<Secret> {
    let material = hex::encode(crate::utils::encryption::generate_key_material());
    let envelope = cipher.seal(material.as_bytes())?;
    Ok(Secret {
        id: new_id(SECRET),
        secret_version: 1,
        envelope,
        created_at: now,
    })
}

async fn load_tenant(state: &AppState, tenant_id: &str) -> SchedulerResult<Tenant> {
    state
        .tenants
        .find_tenant(tenant_id)
        .await?
        .ok_or(SchedulerError::NotFound("tenant"))
}

/// Provisions keys for a fresh tenant or starts a rollover for a provisioned one.
pub async fn rotate_signing_key(
    state: &AppState,
    tenant_id: &str,
    now: DateTime<Utc>,
) -> SchedulerResult<SigningKeys> {
    let tenant = load_tenant(state, tenant_id).await?;
    let cipher = state.cipher.as_ref();

    let (next, secrets) = match &tenant.signing_keys {
        SigningKeys::Unprovisioned => {
            let current = generate_signing_secret(cipher, now)?;
            let next = generate_signing_secret(cipher, now)?;
            let keys = tenant
                .signing_keys
                .provision(current.id.clone(), next.id.clone())?;
            (keys, vec![current, next])
        }
        _ => {
            let fresh = generate_signing_secret(cipher, now)?;
            let promote_at = now + state.settings().key_rollover_window;
            let keys = tenant
                .signing_keys
                .begin_rotation(fresh.id.clone(), promote_at)?;
            (keys, vec![fresh])
        }
    };

    state
        .tenants
        .replace_signing_keys(tenant_id, &tenant.signing_keys, &next, &secrets)
        .await?;
    info!(tenant_id = %tenant_id, state = ?next, "signing keys rotated");
    Ok(next)
}

/// Promotes every rollover whose window has elapsed.
pub async fn promote_due_rotations(state: &AppState, now: DateTime<Utc>) -> SchedulerResult<usize> {
    let due = state.tenants.tenants_with_due_promotion(now, 100).await?;
    let mut promoted = 0;
    for tenant in due {
        let fresh = generate_signing_secret(state.cipher.as_ref(), now)?;
        let next = match tenant.signing_keys.promote(fresh.id.clone(), now) {
            Ok(next) => next,
            Err(_) => continue,
        };
        match state
            .tenants
            .replace_signing_keys(&tenant.id, &tenant.signing_keys, &next, &[fresh])
            .await
        {
            Ok(()) => {
                promoted += 1;
                info!(tenant_id = %tenant.id, "promoted next signing key");
            }
            Err(SchedulerError::Conflict(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(promoted)
}

/// Re-wraps live secrets under the newest master key.
pub async fn rewrap_stale_secrets(state: &AppState, now: DateTime<Utc>) -> SchedulerResult<usize> {
    let latest = state.cipher.latest_master_key_id();
    let stale = state.secrets.live_secrets_wrapped_before(latest, 100).await?;
    let mut rewrapped = 0;
    for secret in stale {
        let envelope = match state.cipher.rewrap(&secret.envelope) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(secret_id = %secret.id, error = %e, "failed to re-wrap secret");
                continue;
            }
        };
        let replacement = Secret {
            id: new_id(SECRET),
            secret_version: secret.secret_version + 1,
            envelope,
            created_at: now,
        };
        if state.secrets.supersede_secret(&secret.id, &replacement).await? > 0 {
            rewrapped += 1;
        }
    }
    if rewrapped > 0 {
        info!(count = rewrapped, master_key_id = latest, "re-wrapped secrets");
    }
    Ok(rewrapped)
}

async fn open_secret(state: &AppState, secret_id: &str) -> SchedulerResult<Vec<u8>> {
    let secret = state
        .secrets
        .find_secret(secret_id)
        .await?
        .ok_or(SchedulerError::NotFound("secret"))?;
    Ok(state.cipher.open(&secret.envelope)?)
}

/// Key material for signing outgoing requests, if the tenant has keys.
pub async fn signing_key_material(state: &AppState, tenant: &Tenant) -> SchedulerResult<Option<Vec<u8>>> {
    match tenant.signing_keys.signing_key() {
        Some(id) => Ok(Some(open_secret(state, id).await?)),
        None => Ok(None),
    }
}

/// Tenant-facing view of its key material.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RevealedSigningKeys {
    pub current: Option<String>,
    pub next: Option<String>,
    pub promote_at: Option<DateTime<Utc>>,
}

pub async fn reveal_signing_keys(state: &AppState, tenant_id: &str) -> SchedulerResult<RevealedSigningKeys> {
    let tenant = load_tenant(state, tenant_id).await?;
    let (current, next, promote_at) = tenant.signing_keys.columns();
    let reveal = |bytes: Vec<u8>| String::from_utf8_lossy(&bytes).into_owned();
    let current = match current {
        Some(id) => Some(reveal(open_secret(state, id).await?)),
        None => None,
    };
    let next = match next {
        Some(id) => Some(reveal(open_secret(state, id).await?)),
        None => None,
    };
    Ok(RevealedSigningKeys {
        current,
        next,
        promote_at,
    })
}

/// Verifies a signature header produced for this tenant by either live key.
pub async fn verify_callback(
    state: &AppState,
    tenant_id: &str,
    header: &str,
    path: &str,
    body: Option<&str>,
    now: DateTime<Utc>,
) -> SchedulerResult<bool> {
    let tenant = load_tenant(state, tenant_id).await?;
    let mut keys = Vec::new();
    for id in tenant.signing_keys.verification_keys() {
        keys.push(open_secret(state, id).await?);
    }
    if keys.is_empty() {
        return Err(SchedulerError::validation("tenant has no signing keys"));
    }
    Ok(signing::verify(
        &keys,
        header,
        path,
        body,
        now,
        state.settings().signature_tolerance,
    )
    .is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::models::secret::SealedEnvelope;
    use crate::state::test_support::harness;
    use crate::utils::encryption::{EncryptionError, MockEnvelopeCipher};
    use chrono::Duration;

    fn dual() -> SigningKeys {
        SigningKeys::Dual {
            current: "secret_a".into(),
            next: "secret_b".into(),
        }
    }

    #[test]
    fn storage_never_holds_exactly_one_key() {
        assert!(SigningKeys::from_columns(Some("a".into()), None, None).is_err());
        assert!(SigningKeys::from_columns(None, Some("b".into()), None).is_err());
        assert!(SigningKeys::from_columns(None, None, Some(Utc::now())).is_err());
        assert_eq!(
            SigningKeys::from_columns(None, None, None),
            Ok(SigningKeys::Unprovisioned)
        );
    }

    #[test]
    fn transitions_follow_the_state_machine() {
        let now = Utc::now();
        let provisioned = SigningKeys::Unprovisioned
            .provision("secret_a".into(), "secret_b".into())
            .unwrap();
        assert_eq!(provisioned, dual());
        assert!(provisioned.provision("x".into(), "y".into()).is_err());

        let rolling = provisioned
            .begin_rotation("secret_c".into(), now + Duration::hours(1))
            .unwrap();
        assert_eq!(rolling.signing_key(), Some("secret_a"));
        assert_eq!(rolling.verification_keys(), vec!["secret_a", "secret_c"]);
        assert!(rolling.begin_rotation("secret_d".into(), now).is_err());

        assert!(!rolling.is_promotion_due(now));
        assert!(rolling.promote("secret_d".into(), now).is_err());

        let later = now + Duration::hours(1);
        let promoted = rolling.promote("secret_d".into(), later).unwrap();
        assert_eq!(
            promoted,
            SigningKeys::Dual {
                current: "secret_c".into(),
                next: "secret_d".into()
            }
        );
    }

    #[test]
    fn replace_secret_swaps_only_the_matching_reference() {
        let swapped = dual().replace_secret("secret_b", "secret_z");
        assert_eq!(
            swapped,
            SigningKeys::Dual {
                current: "secret_a".into(),
                next: "secret_z".into()
            }
        );
    }

    #[test]
    fn cipher_failures_surface_as_encryption_errors() {
        let mut cipher = MockEnvelopeCipher::new();
        cipher
            .expect_seal()
            .returning(|_| Err(EncryptionError::NoMasterKeys));
        let err = generate_signing_secret(&cipher, Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::Encryption(EncryptionError::NoMasterKeys)
        ));
    }

    #[test]
    fn generated_secrets_are_sealed_by_the_cipher() {
        let mut cipher = MockEnvelopeCipher::new();
        cipher.expect_seal().times(1).returning(|plaintext| {
            assert_eq!(plaintext.len(), 64);
            Ok(SealedEnvelope {
                master_key_id: 7,
                algorithm: "test".into(),
                encrypted_dek: vec![1],
                dek_nonce: vec![2],
                encrypted_data: vec![3],
                data_nonce: vec![4],
            })
        });
        let secret = generate_signing_secret(&cipher, Utc::now()).unwrap();
        assert_eq!(secret.envelope.master_key_id, 7);
        assert_eq!(secret.secret_version, 1);
    }

    #[tokio::test]
    async fn rotation_provisions_then_rolls_then_promotes() {
        let h = harness();
        let tenant = h.tenant().await;
        let now = h.clock.now();

        let provisioned = rotate_signing_key(&h.state, &tenant.id, now).await.unwrap();
        assert!(matches!(provisioned, SigningKeys::Dual { .. }));

        let rolling = rotate_signing_key(&h.state, &tenant.id, now).await.unwrap();
        let SigningKeys::Rolling { promote_at, .. } = rolling.clone() else {
            panic!("expected rolling state, got {:?}", rolling);
        };
        assert!(matches!(
            rotate_signing_key(&h.state, &tenant.id, now).await,
            Err(SchedulerError::Conflict(_))
        ));

        assert_eq!(promote_due_rotations(&h.state, now).await.unwrap(), 0);
        assert_eq!(promote_due_rotations(&h.state, promote_at).await.unwrap(), 1);

        let stored = h.state.tenants.find_tenant(&tenant.id).await.unwrap().unwrap();
        let SigningKeys::Dual { current, .. } = &stored.signing_keys else {
            panic!("expected dual state");
        };
        let SigningKeys::Rolling { next, .. } = &rolling else { unreachable!() };
        assert_eq!(current, next);
    }

    #[tokio::test]
    async fn both_keys_verify_during_the_rollover_window() {
        let h = harness();
        let tenant = h.tenant().await;
        let now = h.clock.now();
        rotate_signing_key(&h.state, &tenant.id, now).await.unwrap();
        rotate_signing_key(&h.state, &tenant.id, now).await.unwrap();

        let revealed = reveal_signing_keys(&h.state, &tenant.id).await.unwrap();
        for key in [revealed.current.unwrap(), revealed.next.unwrap()] {
            let sig = signing::sign(key.as_bytes(), now, "https://tenant.test/cb", Some("{}")).unwrap();
            let header = signing::signature_header_value(&sig);
            assert!(verify_callback(&h.state, &tenant.id, &header, "/cb", Some("{}"), now)
                .await
                .unwrap());
        }

        let forged = signing::sign(b"not-a-tenant-key", now, "https://tenant.test/cb", None).unwrap();
        let header = signing::signature_header_value(&forged);
        assert!(!verify_callback(&h.state, &tenant.id, &header, "/cb", None, now)
            .await
            .unwrap());
    }
}
