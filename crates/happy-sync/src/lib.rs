//! # happy-sync
//!
//! The sync client embedded in the CLI daemon (and, structurally, in any
//! other client): one multiplexed socket to the relay, a local entity
//! cache that converges to the server's view, an outbox with optimistic
//! concurrency and bounded rebase-and-retry, a typed RPC surface, and a
//! reconnect loop with bounded exponential backoff.
//!
//! Everything user-content-shaped is encrypted before it reaches the
//! socket and decrypted on receipt; the relay only ever brokers
//! ciphertext.

#![deny(unsafe_code)]

pub mod client;
pub mod cursor;
pub mod errors;
pub mod socket;

pub use client::{MutateOptions, SyncClient, SyncConfig, SyncEvent};
pub use errors::SyncError;
