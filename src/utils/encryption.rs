//! Envelope encryption for stored key material.
//!
//! Every secret gets its own random data-encryption key (DEK). The DEK encrypts
//! the payload and is itself wrapped by a versioned master key, so rotating a
//! master key only re-wraps DEKs and never touches payload ciphertext.

use aes_gcm::{aead::Aead, aead::KeyInit, Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand_core::OsRng;
use rand_core::RngCore;
use std::collections::BTreeMap;

use crate::models::secret::SealedEnvelope;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
pub const ALGORITHM: &str = "AES-256-GCM";

#[derive(thiserror::Error, Debug)]
pub enum EncryptionError {
    #[error("encryption key must be 32 bytes")]
    InvalidKeyLength,
    #[error("failed to encrypt secret")]
    Encrypt,
    #[error("failed to decrypt secret")]
    Decrypt,
    #[error("invalid ciphertext encoding")]
    InvalidEncoding,
    #[error("master key {0} is not loaded")]
    UnknownMasterKey(i32),
    #[error("no master keys configured")]
    NoMasterKeys,
    #[error("unsupported algorithm {0}")]
    UnsupportedAlgorithm(String),
}

pub fn decode_key(key_b64: &str) -> Result<Vec<u8>, EncryptionError> {
    let decoded = STANDARD
        .decode(key_b64)
        .map_err(|_| EncryptionError::InvalidEncoding)?;
    if decoded.len() != KEY_LEN {
        return Err(EncryptionError::InvalidKeyLength);
    }
    Ok(decoded)
}

/// Fresh random key material (signing keys, DEKs).
pub fn generate_key_material() -> Vec<u8> {
    let mut key = vec![0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}

/// Cipher collaborator used by the key rotation manager.
#[cfg_attr(test, mockall::automock)]
pub trait EnvelopeCipher: Send + Sync {
    fn latest_master_key_id(&self) -> i32;

    /// Encrypts `plaintext` under a fresh DEK wrapped by the latest master key.
    fn seal(&self, plaintext: &[u8]) -> Result<SealedEnvelope, EncryptionError>;

    fn open(&self, envelope: &SealedEnvelope) -> Result<Vec<u8>, EncryptionError>;

    /// Re-wraps the DEK under the latest master key. Payload ciphertext is kept.
    fn rewrap(&self, envelope: &SealedEnvelope) -> Result<SealedEnvelope, EncryptionError>;
}

/// AES-256-GCM master keys indexed by version.
pub struct KeyRing {
    keys: BTreeMap<i32, Vec<u8>>,
}

impl KeyRing {
    pub fn new(keys: impl IntoIterator<Item = (i32, Vec<u8>)>) -> Result<Self, EncryptionError> {
        let mut map = BTreeMap::new();
        for (id, key) in keys {
            if key.len() != KEY_LEN {
                return Err(EncryptionError::InvalidKeyLength);
            }
            map.insert(id, key);
        }
        if map.is_empty() {
            return Err(EncryptionError::NoMasterKeys);
        }
        Ok(Self { keys: map })
    }

    fn key(&self, id: i32) -> Result<&[u8], EncryptionError> {
        self.keys
            .get(&id)
            .map(|k| k.as_slice())
            .ok_or(EncryptionError::UnknownMasterKey(id))
    }

    fn latest(&self) -> Result<(i32, &[u8]), EncryptionError> {
        self.keys
            .iter()
            .next_back()
            .map(|(id, key)| (*id, key.as_slice()))
            .ok_or(EncryptionError::NoMasterKeys)
    }

    fn unwrap_dek(&self, envelope: &SealedEnvelope) -> Result<Vec<u8>, EncryptionError> {
        if envelope.algorithm != ALGORITHM {
            return Err(EncryptionError::UnsupportedAlgorithm(
                envelope.algorithm.clone(),
            ));
        }
        let master = self.key(envelope.master_key_id)?;
        let dek = aes_decrypt(master, &envelope.dek_nonce, &envelope.encrypted_dek)?;
        if dek.len() != KEY_LEN {
            return Err(EncryptionError::InvalidKeyLength);
        }
        Ok(dek)
    }
}

impl EnvelopeCipher for KeyRing {
    fn latest_master_key_id(&self) -> i32 {
        self.latest().map(|(id, _)| id).unwrap_or_default()
    }

    fn seal(&self, plaintext: &[u8]) -> Result<SealedEnvelope, EncryptionError> {
        let (master_key_id, master) = self.latest()?;
        let dek = generate_key_material();
        let (dek_nonce, data_nonce) = distinct_nonces();

        Ok(SealedEnvelope {
            master_key_id,
            algorithm: ALGORITHM.to_string(),
            encrypted_dek: aes_encrypt(master, &dek_nonce, &dek)?,
            dek_nonce: dek_nonce.to_vec(),
            encrypted_data: aes_encrypt(&dek, &data_nonce, plaintext)?,
            data_nonce: data_nonce.to_vec(),
        })
    }

    fn open(&self, envelope: &SealedEnvelope) -> Result<Vec<u8>, EncryptionError> {
        let dek = self.unwrap_dek(envelope)?;
        aes_decrypt(&dek, &envelope.data_nonce, &envelope.encrypted_data)
    }

    fn rewrap(&self, envelope: &SealedEnvelope) -> Result<SealedEnvelope, EncryptionError> {
        let dek = self.unwrap_dek(envelope)?;
        let (master_key_id, master) = self.latest()?;
        let mut dek_nonce = random_nonce();
        while dek_nonce.as_slice() == envelope.data_nonce.as_slice() {
            dek_nonce = random_nonce();
        }

        Ok(SealedEnvelope {
            master_key_id,
            algorithm: envelope.algorithm.clone(),
            encrypted_dek: aes_encrypt(master, &dek_nonce, &dek)?,
            dek_nonce: dek_nonce.to_vec(),
            encrypted_data: envelope.encrypted_data.clone(),
            data_nonce: envelope.data_nonce.clone(),
        })
    }
}

fn random_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

fn distinct_nonces() -> ([u8; NONCE_LEN], [u8; NONCE_LEN]) {
    let first = random_nonce();
    let mut second = random_nonce();
    while second == first {
        second = random_nonce();
    }
    (first, second)
}

fn aes_encrypt(key: &[u8], nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| EncryptionError::InvalidKeyLength)?;
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| EncryptionError::Encrypt)
}

fn aes_decrypt(key: &[u8], nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
    if nonce.len() != NONCE_LEN {
        return Err(EncryptionError::InvalidEncoding);
    }
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| EncryptionError::InvalidKeyLength)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| EncryptionError::Decrypt)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(ids: &[i32]) -> KeyRing {
        KeyRing::new(ids.iter().map(|id| (*id, vec![*id as u8 + 1; 32]))).unwrap()
    }

    #[test]
    fn seal_uses_latest_master_key_and_distinct_nonces() {
        let keys = ring(&[1, 2]);
        let sealed = keys.seal(b"signing key").unwrap();

        assert_eq!(sealed.master_key_id, 2);
        assert_eq!(sealed.algorithm, ALGORITHM);
        assert_ne!(sealed.dek_nonce, sealed.data_nonce);
        assert_ne!(sealed.encrypted_data, b"signing key".to_vec());
        assert_eq!(keys.open(&sealed).unwrap(), b"signing key".to_vec());
    }

    #[test]
    fn rewrap_moves_dek_to_newest_key_and_keeps_payload() {
        let old = ring(&[1]);
        let sealed = old.seal(b"payload").unwrap();

        let rotated = ring(&[1, 3]);
        let rewrapped = rotated.rewrap(&sealed).unwrap();

        assert_eq!(rewrapped.master_key_id, 3);
        assert_eq!(rewrapped.encrypted_data, sealed.encrypted_data);
        assert_ne!(rewrapped.encrypted_dek, sealed.encrypted_dek);
        assert_eq!(rotated.open(&rewrapped).unwrap(), b"payload".to_vec());
    }

    #[test]
    fn open_fails_when_master_key_is_missing() {
        let sealed = ring(&[5]).seal(b"x").unwrap();
        let err = ring(&[6]).open(&sealed);
        assert!(matches!(err, Err(EncryptionError::UnknownMasterKey(5))));
    }

    #[test]
    fn invalid_key_material_is_rejected() {
        assert!(matches!(
            KeyRing::new(vec![(1, vec![0u8; 3])]),
            Err(EncryptionError::InvalidKeyLength)
        ));
        assert!(matches!(
            KeyRing::new(Vec::new()),
            Err(EncryptionError::NoMasterKeys)
        ));
        assert!(matches!(
            decode_key("abc"),
            Err(EncryptionError::InvalidEncoding)
        ));
    }
}
