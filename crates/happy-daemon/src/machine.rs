//! Machine identity.
//!
//! One machine per (account, hostname, home-directory): the id is a
//! digest of hostname + home dir, so every daemon boot on the same host
//! converges on the same Machine row instead of forking siblings.

use happy_core::entities::{MachineRecord, MachineStatus};
use happy_core::{MachineId, SessionId};
use sha2::{Digest, Sha256};

/// Hostname of this machine (best effort).
pub fn hostname() -> String {
    whoami::fallible::hostname().unwrap_or_else(|_| "unknown".into())
}

/// Home directory of the daemon user.
pub fn home_dir() -> String {
    std::env::var("HOME").unwrap_or_else(|_| "/tmp".into())
}

/// Derive the stable machine id for a hostname + home-dir pair.
pub fn machine_id_for(hostname: &str, home_dir: &str) -> MachineId {
    let mut hasher = Sha256::new();
    hasher.update(hostname.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(home_dir.as_bytes());
    let digest = hasher.finalize();
    // 16 bytes of hex is plenty for uniqueness and keeps refs short.
    let hex: String = digest[..16].iter().map(|b| format!("{b:02x}")).collect();
    MachineId::from(hex)
}

/// The machine id for this host.
pub fn local_machine_id() -> MachineId {
    machine_id_for(&hostname(), &home_dir())
}

/// Build the machine metadata document published in update bodies.
pub fn machine_record(status: MachineStatus, active_sessions: Vec<SessionId>) -> MachineRecord {
    MachineRecord {
        hostname: hostname(),
        home_dir: home_dir(),
        os: std::env::consts::OS.to_owned(),
        status,
        active_sessions,
    }
}
