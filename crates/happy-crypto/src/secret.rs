//! Master secret and key derivation.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

use crate::CryptoError;

/// Domain separation salt for all Happy key derivations.
const HKDF_SALT: &[u8] = b"happy-coder.v1";

/// The 32-byte account master secret. All content keys derive from it.
#[derive(Clone)]
pub struct MasterSecret([u8; 32]);

impl MasterSecret {
    /// Generate a fresh random secret.
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Rehydrate from the base64 form used in the credentials file and
    /// the `HAPPY_MASTER_SECRET` test-environment variable.
    pub fn from_base64(value: &str) -> Result<Self, CryptoError> {
        let raw = BASE64_STANDARD
            .decode(value.trim())
            .map_err(|_| CryptoError::KeyMaterial("master secret is not base64".into()))?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| CryptoError::KeyMaterial("master secret must be 32 bytes".into()))?;
        Ok(Self(bytes))
    }

    /// Base64 form for persistence.
    pub fn to_base64(&self) -> String {
        BASE64_STANDARD.encode(self.0)
    }

    /// Derive the content key for an account.
    ///
    /// HKDF-SHA256 with a fixed salt and `content:<account-id>` as info,
    /// so keys for different accounts (and future purposes) never collide.
    pub fn derive_content_key(&self, account_id: &str) -> [u8; 32] {
        let info = format!("content:{account_id}");
        derive_key(&self.0, HKDF_SALT, info.as_bytes())
    }
}

impl std::fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material must never reach logs.
        f.write_str("MasterSecret(..)")
    }
}

fn derive_key(ikm: &[u8], salt: &[u8], info: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = [0u8; 32];
    // 32 bytes is always a valid HKDF-SHA256 output length.
    hk.expand(info, &mut okm).expect("hkdf output length");
    okm
}
