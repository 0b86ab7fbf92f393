//! # happy-crypto
//!
//! The encryption envelope that keeps the relay content-blind. Every
//! update and message `body` on the wire is
//! `base64(version-byte || nonce || ciphertext)` where the version byte
//! selects the AEAD scheme. Scheme `0x01` (the only one implemented) is
//! AES-256-GCM with a 96-bit random nonce and a per-account key derived
//! from the master secret via HKDF-SHA256.
//!
//! Key material never leaves this crate as raw bytes except through the
//! credentials file, which is written mode 0600.

#![deny(unsafe_code)]

pub mod credentials;
pub mod envelope;
pub mod secret;

pub use credentials::Credentials;
pub use envelope::{SecretBox, SCHEME_AES_256_GCM};
pub use secret::MasterSecret;

/// Errors from sealing, opening, or key handling.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Base64 decoding of a wire body failed.
    #[error("invalid base64 body")]
    Base64(#[from] base64::DecodeError),

    /// The envelope is too short to hold version byte + nonce.
    #[error("envelope truncated ({len} bytes)")]
    Truncated {
        /// Observed length.
        len: usize,
    },

    /// The version byte names a scheme this build does not implement.
    #[error("unsupported envelope scheme 0x{version:02x}")]
    UnsupportedScheme {
        /// The observed version byte.
        version: u8,
    },

    /// AEAD rejected the ciphertext (wrong key or tampering).
    #[error("decryption failed")]
    Aead,

    /// Plaintext failed to (de)serialize.
    #[error("payload encoding: {0}")]
    Encoding(#[from] serde_json::Error),

    /// Key material was malformed.
    #[error("invalid key material: {0}")]
    KeyMaterial(String),

    /// Credentials file I/O.
    #[error("credentials file: {0}")]
    Io(#[from] std::io::Error),
}
