//! Credentials file I/O.
//!
//! Reads and writes `<state-dir>/credentials.json` with secure file
//! permissions (0o600): the account identifier, the relay bearer token,
//! and the base64 master secret. Test environments may override the
//! secret via `HAPPY_MASTER_SECRET` instead.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{CryptoError, MasterSecret};

/// Default credentials file name.
const CREDENTIALS_FILE_NAME: &str = "credentials.json";

/// Env var holding a base64 master secret (test environments only).
pub const MASTER_SECRET_ENV: &str = "HAPPY_MASTER_SECRET";

/// On-disk credentials document.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    /// Schema version.
    pub version: u32,
    /// Account principal.
    pub account_id: String,
    /// Relay bearer token.
    pub token: String,
    /// Base64 master secret.
    pub master_secret: String,
}

impl Credentials {
    /// Build a fresh credentials document.
    pub fn new(account_id: impl Into<String>, token: impl Into<String>, secret: &MasterSecret) -> Self {
        Self {
            version: 1,
            account_id: account_id.into(),
            token: token.into(),
            master_secret: secret.to_base64(),
        }
    }

    /// Decode the stored master secret.
    pub fn master_secret(&self) -> Result<MasterSecret, CryptoError> {
        MasterSecret::from_base64(&self.master_secret)
    }
}

/// Path of the credentials file under the state directory.
pub fn credentials_path(state_dir: &Path) -> PathBuf {
    state_dir.join(CREDENTIALS_FILE_NAME)
}

/// Load credentials from file.
///
/// Returns `None` if the file doesn't exist, is invalid, or carries an
/// unsupported version.
pub fn load_credentials(path: &Path) -> Option<Credentials> {
    let data = match std::fs::read_to_string(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::warn!("failed to read credentials file: {e}");
            return None;
        }
    };

    match serde_json::from_str::<Credentials>(&data) {
        Ok(creds) if creds.version == 1 => Some(creds),
        Ok(creds) => {
            tracing::warn!("unsupported credentials version: {}", creds.version);
            None
        }
        Err(e) => {
            tracing::warn!("failed to parse credentials file: {e}");
            None
        }
    }
}

/// Save credentials, creating parent directories and setting mode 0600.
///
/// The write is atomic (temp file + rename) so a crash never leaves a
/// half-written credentials file behind.
pub fn save_credentials(path: &Path, creds: &Credentials) -> Result<(), CryptoError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(creds)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &json)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        let _ = std::fs::set_permissions(&tmp, perms);
    }

    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Resolve the master secret: env override first, credentials file second.
pub fn resolve_master_secret(state_dir: &Path) -> Option<MasterSecret> {
    if let Ok(value) = std::env::var(MASTER_SECRET_ENV) {
        match MasterSecret::from_base64(&value) {
            Ok(secret) => return Some(secret),
            Err(e) => tracing::warn!("ignoring invalid {MASTER_SECRET_ENV}: {e}"),
        }
    }
    let creds = load_credentials(&credentials_path(state_dir))?;
    creds.master_secret().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_creds() -> Credentials {
        Credentials::new("acct-1", "tok-1", &MasterSecret::random())
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = credentials_path(dir.path());
        let creds = make_creds();
        save_credentials(&path, &creds).unwrap();

        let loaded = load_credentials(&path).unwrap();
        assert_eq!(loaded.account_id, "acct-1");
        assert_eq!(loaded.token, "tok-1");
        assert_eq!(loaded.master_secret, creds.master_secret);
    }

    #[test]
    fn load_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_credentials(&credentials_path(dir.path())).is_none());
    }

    #[test]
    fn load_rejects_unknown_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = credentials_path(dir.path());
        let mut creds = make_creds();
        creds.version = 99;
        save_credentials(&path, &creds).unwrap();
        assert!(load_credentials(&path).is_none());
    }

    #[test]
    fn load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = credentials_path(dir.path());
        std::fs::write(&path, "not json").unwrap();
        assert!(load_credentials(&path).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn file_mode_is_0600() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = credentials_path(dir.path());
        save_credentials(&path, &make_creds()).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = credentials_path(dir.path());
        save_credentials(&path, &make_creds()).unwrap();
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
        assert_eq!(names[0], CREDENTIALS_FILE_NAME);
    }

    #[test]
    fn stored_secret_decodes() {
        let secret = MasterSecret::random();
        let creds = Credentials::new("a", "t", &secret);
        let back = creds.master_secret().unwrap();
        assert_eq!(back.to_base64(), secret.to_base64());
    }
}
