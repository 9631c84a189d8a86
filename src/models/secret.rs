use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Ciphertext plus the wrapped data-encryption key that opens it.
#[derive(Debug, Clone, FromRow, PartialEq, Eq)]
pub struct SealedEnvelope {
    pub master_key_id: i32,
    pub algorithm: String,
    pub encrypted_dek: Vec<u8>,
    pub dek_nonce: Vec<u8>,
    pub encrypted_data: Vec<u8>,
    pub data_nonce: Vec<u8>,
}

/// Stored key material. Rows are never updated; re-wrapping creates a new
/// secret with a higher `secret_version`.
#[derive(Debug, Clone, FromRow, PartialEq, Eq)]
pub struct Secret {
    pub id: String,
    pub secret_version: i32,
    #[sqlx(flatten)]
    pub envelope: SealedEnvelope,
    pub created_at: DateTime<Utc>,
}

/// Public view; never exposes ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecretSummary {
    pub id: String,
    pub secret_version: i32,
    pub master_key_id: i32,
    pub algorithm: String,
    pub created_at: DateTime<Utc>,
}

impl From<&Secret> for SecretSummary {
    fn from(secret: &Secret) -> Self {
        Self {
            id: secret.id.clone(),
            secret_version: secret.secret_version,
            master_key_id: secret.envelope.master_key_id,
            algorithm: secret.envelope.algorithm.clone(),
            created_at: secret.created_at,
        }
    }
}
