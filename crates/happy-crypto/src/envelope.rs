//! AEAD envelope: seal and open wire bodies.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::CryptoError;

/// Version byte for AES-256-GCM with a 96-bit nonce.
pub const SCHEME_AES_256_GCM: u8 = 0x01;

const NONCE_LEN: usize = 12;

/// Seals and opens bodies with one derived content key.
#[derive(Clone)]
pub struct SecretBox {
    cipher: Aes256Gcm,
}

impl SecretBox {
    /// Build from a derived 32-byte content key.
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// Encrypt raw bytes into the base64 wire form
    /// `version || nonce || ciphertext`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::Aead)?;

        let mut out = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
        out.push(SCHEME_AES_256_GCM);
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(BASE64_STANDARD.encode(out))
    }

    /// Decrypt a base64 wire body back to raw bytes.
    pub fn open(&self, body: &str) -> Result<Vec<u8>, CryptoError> {
        let raw = BASE64_STANDARD.decode(body)?;
        if raw.len() < 1 + NONCE_LEN {
            return Err(CryptoError::Truncated { len: raw.len() });
        }
        let version = raw[0];
        if version != SCHEME_AES_256_GCM {
            return Err(CryptoError::UnsupportedScheme { version });
        }
        let nonce = Nonce::from_slice(&raw[1..1 + NONCE_LEN]);
        self.cipher
            .decrypt(nonce, &raw[1 + NONCE_LEN..])
            .map_err(|_| CryptoError::Aead)
    }

    /// Seal a serde-serializable value (JSON plaintext).
    pub fn seal_json<T: Serialize>(&self, value: &T) -> Result<String, CryptoError> {
        let plaintext = serde_json::to_vec(value)?;
        self.seal(&plaintext)
    }

    /// Open a body and deserialize the JSON plaintext.
    pub fn open_json<T: DeserializeOwned>(&self, body: &str) -> Result<T, CryptoError> {
        let plaintext = self.open(body)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}

impl std::fmt::Debug for SecretBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretBox(..)")
    }
}
