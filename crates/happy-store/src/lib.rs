//! # happy-store
//!
//! The durable store behind the relay: accounts, machines, sessions, the
//! per-account versioned update log, and the per-session message log.
//!
//! All `body` columns are opaque ciphertext blobs — nothing in this crate
//! parses them. Every write method runs inside a single `SQLite`
//! transaction so callers never observe partial state, and the per-account
//! `seq` counter is advanced under that same transaction, which is what
//! makes `seq` gap-free and totally ordered.

#![deny(unsafe_code)]

pub mod connection;
pub mod errors;
pub mod migrations;
pub mod repositories;
pub mod row_types;
pub mod store;

pub use connection::{new_file, new_in_memory, ConnectionConfig, ConnectionPool};
pub use errors::{Result, StoreError};
pub use migrations::run_migrations;
pub use row_types::{AccountRow, MachineRow, MessageRow, SessionRow, UpdateRow};
pub use store::{MessageOutcome, PublishOutcome, PublishRequest, RelayStore, Replay};
