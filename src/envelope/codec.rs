//! Passcode-sealed envelopes.
//!
//! Wire format: `"<version>:" || base64(salt[16] || nonce[12] || ciphertext || tag[16])`
//!
//! - `v1`: AES-256-GCM
//! - `v2`: ChaCha20-Poly1305
//!
//! The AEAD key is derived from the passcode and the per-envelope salt with
//! Argon2id. Nothing about the passcode is stored beyond what the
//! authentication tag implies.

use aes_gcm::Aes256Gcm;
use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;
pub const KEY_LEN: usize = 32;

/// Envelope errors
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("Unsupported envelope version: {0}")]
    UnsupportedVersion(String),

    #[error("Malformed envelope: {0}")]
    Malformed(String),

    /// Wrong passcode or tampered ciphertext. The two are deliberately
    /// indistinguishable.
    #[error("Authentication failed")]
    AuthFailure,

    #[error("Encryption failed: {0}")]
    Encode(String),

    #[error("Invalid key derivation parameters: {0}")]
    InvalidParams(String),
}

/// Result type for envelope operations
pub type EnvelopeResult<T> = Result<T, EnvelopeError>;

/// Envelope format version, written as the textual prefix of every blob.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeVersion {
    /// AES-256-GCM
    #[default]
    V1,
    /// ChaCha20-Poly1305
    V2,
}

impl EnvelopeVersion {
    pub fn tag(self) -> &'static str {
        match self {
            Self::V1 => "v1",
            Self::V2 => "v2",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "v1" => Some(Self::V1),
            "v2" => Some(Self::V2),
            _ => None,
        }
    }
}

/// Argon2id cost parameters and the version used when sealing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoConfig {
    /// Argon2 iterations
    #[serde(default = "default_time_cost")]
    pub time_cost: u32,
    /// Argon2 memory in KiB
    #[serde(default = "default_memory_cost_kib")]
    pub memory_cost_kib: u32,
    /// Argon2 lanes
    #[serde(default = "default_parallelism")]
    pub parallelism: u32,
    /// Version written by `seal`; `open` accepts every known version.
    #[serde(default)]
    pub version: EnvelopeVersion,
}

fn default_time_cost() -> u32 {
    1
}

fn default_memory_cost_kib() -> u32 {
    64 * 1024
}

fn default_parallelism() -> u32 {
    4
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            time_cost: default_time_cost(),
            memory_cost_kib: default_memory_cost_kib(),
            parallelism: default_parallelism(),
            version: EnvelopeVersion::default(),
        }
    }
}

impl CryptoConfig {
    /// Low-memory profile for test suites. Never use in production.
    pub fn testing() -> Self {
        Self {
            memory_cost_kib: 1024,
            ..Self::default()
        }
    }

    pub fn with_version(mut self, version: EnvelopeVersion) -> Self {
        self.version = version;
        self
    }
}

/// Seals and opens envelopes with a fixed, validated `CryptoConfig`.
#[derive(Debug, Clone)]
pub struct EnvelopeCodec {
    config: CryptoConfig,
    params: Params,
}

impl EnvelopeCodec {
    /// Validate the Argon2 parameters and build a codec.
    pub fn new(config: CryptoConfig) -> EnvelopeResult<Self> {
        let params = Params::new(
            config.memory_cost_kib,
            config.time_cost,
            config.parallelism,
            Some(KEY_LEN),
        )
        .map_err(|e| EnvelopeError::InvalidParams(e.to_string()))?;

        Ok(Self { config, params })
    }

    pub fn config(&self) -> &CryptoConfig {
        &self.config
    }

    /// Encrypt `plaintext` under a key derived from `code`.
    ///
    /// Salt and nonce are drawn fresh on every call, so sealing the same
    /// input twice never yields the same blob.
    pub fn seal(&self, plaintext: &[u8], code: &str) -> EnvelopeResult<Vec<u8>> {
        let mut salt = [0u8; SALT_LEN];
        OsRng
            .try_fill_bytes(&mut salt)
            .map_err(|e| EnvelopeError::Encode(format!("salt: {e}")))?;

        let key = self.derive_key(code, &salt)?;

        let mut nonce = [0u8; NONCE_LEN];
        OsRng
            .try_fill_bytes(&mut nonce)
            .map_err(|e| EnvelopeError::Encode(format!("nonce: {e}")))?;

        let ciphertext = match self.config.version {
            EnvelopeVersion::V1 => Aes256Gcm::new_from_slice(&key[..])
                .map_err(|e| EnvelopeError::Encode(format!("cipher: {e}")))?
                .encrypt(aes_gcm::Nonce::from_slice(&nonce), plaintext),
            EnvelopeVersion::V2 => ChaCha20Poly1305::new_from_slice(&key[..])
                .map_err(|e| EnvelopeError::Encode(format!("cipher: {e}")))?
                .encrypt(Nonce::from_slice(&nonce), plaintext),
        }
        .map_err(|_| EnvelopeError::Encode("aead seal failed".to_string()))?;

        let mut raw = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
        raw.extend_from_slice(&salt);
        raw.extend_from_slice(&nonce);
        raw.extend_from_slice(&ciphertext);

        let encoded = BASE64.encode(&raw);
        let tag = self.config.version.tag();
        let mut out = Vec::with_capacity(tag.len() + 1 + encoded.len());
        out.extend_from_slice(tag.as_bytes());
        out.push(b':');
        out.extend_from_slice(encoded.as_bytes());
        Ok(out)
    }

    /// Decrypt a blob produced by `seal`.
    ///
    /// The version prefix is checked before any key derivation takes place.
    pub fn open(&self, blob: &[u8], code: &str) -> EnvelopeResult<Vec<u8>> {
        let (version, raw) = parse_blob(blob)?;

        let salt = &raw[..SALT_LEN];
        let nonce = &raw[SALT_LEN..SALT_LEN + NONCE_LEN];
        let ciphertext = &raw[SALT_LEN + NONCE_LEN..];

        let key = self.derive_key(code, salt)?;

        let plaintext = match version {
            EnvelopeVersion::V1 => Aes256Gcm::new_from_slice(&key[..])
                .map_err(|e| EnvelopeError::Encode(format!("cipher: {e}")))?
                .decrypt(aes_gcm::Nonce::from_slice(nonce), ciphertext),
            EnvelopeVersion::V2 => ChaCha20Poly1305::new_from_slice(&key[..])
                .map_err(|e| EnvelopeError::Encode(format!("cipher: {e}")))?
                .decrypt(Nonce::from_slice(nonce), ciphertext),
        };

        plaintext.map_err(|_| EnvelopeError::AuthFailure)
    }

    fn derive_key(&self, code: &str, salt: &[u8]) -> EnvelopeResult<Zeroizing<[u8; KEY_LEN]>> {
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone());

        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        argon2
            .hash_password_into(code.as_bytes(), salt, &mut key[..])
            .map_err(|e| EnvelopeError::Encode(format!("key derivation: {e}")))?;
        Ok(key)
    }
}

/// Split a blob into its version and decoded `salt || nonce || ciphertext`.
fn parse_blob(blob: &[u8]) -> EnvelopeResult<(EnvelopeVersion, Vec<u8>)> {
    let text = std::str::from_utf8(blob)
        .map_err(|_| EnvelopeError::Malformed("not valid UTF-8".to_string()))?;

    let (tag, body) = text
        .split_once(':')
        .ok_or_else(|| EnvelopeError::Malformed("missing version prefix".to_string()))?;

    let version = match EnvelopeVersion::from_tag(tag) {
        Some(version) => version,
        None if looks_like_version(tag) => {
            return Err(EnvelopeError::UnsupportedVersion(tag.to_string()))
        }
        None => return Err(EnvelopeError::Malformed("missing version prefix".to_string())),
    };

    let raw = BASE64
        .decode(body)
        .map_err(|e| EnvelopeError::Malformed(format!("base64: {e}")))?;

    if raw.len() < SALT_LEN + NONCE_LEN + 1 {
        return Err(EnvelopeError::Malformed("payload too short".to_string()));
    }

    Ok((version, raw))
}

/// `v` followed by one or more ASCII digits.
fn looks_like_version(tag: &str) -> bool {
    tag.strip_prefix('v')
        .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}
