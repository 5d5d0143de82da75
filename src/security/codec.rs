//! Payload codec.
//!
//! AES-256-GCM over the whole decrypted request. A blob is the URL-safe
//! base64 text of `version || nonce || ciphertext || tag`; the version byte is
//! bound as associated data so it cannot be swapped without failing the tag.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Key size (256 bits)
pub const KEY_SIZE: usize = 32;
/// Nonce size (96 bits for GCM)
pub const NONCE_SIZE: usize = 12;
/// Tag size (128 bits)
pub const TAG_SIZE: usize = 16;
/// Current blob layout version.
pub const BLOB_VERSION: u8 = 1;

const HEADER_SIZE: usize = 1 + NONCE_SIZE;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("key is not valid URL-safe base64")]
    InvalidEncoding,

    #[error("key must decode to {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

#[derive(Debug, Error)]
pub enum EncryptionError {
    #[error("payload encryption failed")]
    Seal,
}

/// Why a blob was rejected. Never carries key or ciphertext bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptionFailure {
    /// Not base64 at all.
    Encoding,
    /// Shorter than header plus tag.
    Truncated,
    /// Version byte we do not understand.
    UnsupportedVersion,
    /// Tag verification failed: wrong key or modified bytes.
    Authentication,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("payload could not be decrypted ({})", .reason.as_str())]
pub struct DecryptionError {
    pub reason: DecryptionFailure,
}

impl DecryptionFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Encoding => "malformed encoding",
            Self::Truncated => "truncated blob",
            Self::UnsupportedVersion => "unsupported blob version",
            Self::Authentication => "authentication failed",
        }
    }
}

impl From<DecryptionFailure> for DecryptionError {
    fn from(reason: DecryptionFailure) -> Self {
        Self { reason }
    }
}

/// Pre-shared symmetric key.
#[derive(Clone, PartialEq, Eq)]
pub struct Key([u8; KEY_SIZE]);

impl Key {
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Fresh random key from the OS RNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Parse the textual form shared out-of-band with clients.
    pub fn from_base64(text: &str) -> Result<Self, KeyError> {
        let decoded = URL_SAFE
            .decode(text.trim())
            .map_err(|_| KeyError::InvalidEncoding)?;
        let bytes: [u8; KEY_SIZE] =
            decoded
                .as_slice()
                .try_into()
                .map_err(|_| KeyError::InvalidLength {
                    expected: KEY_SIZE,
                    actual: decoded.len(),
                })?;
        Ok(Self(bytes))
    }

    pub fn to_base64(&self) -> String {
        URL_SAFE.encode(self.0)
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Key(<redacted>)")
    }
}

/// Opaque authenticated ciphertext as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncryptedBlob(String);

impl EncryptedBlob {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<String> for EncryptedBlob {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for EncryptedBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Encrypts and decrypts request payloads with one session-wide key.
#[derive(Clone)]
pub struct Codec {
    cipher: Aes256Gcm,
}

impl Codec {
    pub fn new(key: &Key) -> Self {
        Self {
            cipher: Aes256Gcm::new(GenericArray::from_slice(&key.0)),
        }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedBlob, EncryptionError> {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let aad = [BLOB_VERSION];
        let sealed = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| EncryptionError::Seal)?;

        let mut raw = Vec::with_capacity(HEADER_SIZE + sealed.len());
        raw.push(BLOB_VERSION);
        raw.extend_from_slice(&nonce);
        raw.extend_from_slice(&sealed);
        Ok(EncryptedBlob(URL_SAFE.encode(raw)))
    }

    /// Decrypt a blob. Either the whole plaintext comes back or nothing does.
    pub fn decrypt(&self, blob: &str) -> Result<Vec<u8>, DecryptionError> {
        let raw = URL_SAFE
            .decode(blob.trim())
            .map_err(|_| DecryptionFailure::Encoding)?;
        if raw.len() < HEADER_SIZE + TAG_SIZE {
            return Err(DecryptionFailure::Truncated.into());
        }
        if raw[0] != BLOB_VERSION {
            return Err(DecryptionFailure::UnsupportedVersion.into());
        }

        let (header, sealed) = raw.split_at(HEADER_SIZE);
        let nonce = &header[1..];
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: sealed,
                    aad: &header[..1],
                },
            )
            .map_err(|_| DecryptionFailure::Authentication.into())
    }
}
