//! High-level transactional `RelayStore` API.
//!
//! Composes the repositories into atomic operations. Every write runs
//! inside a single `SQLite` transaction: seq assignment, the version
//! check, the log insert and the entity-head update commit together or
//! not at all, which is exactly what makes the per-account `seq` gap-free
//! and the optimistic-concurrency check race-free.

use happy_core::entities::{EntityKind, EntityRef, MachineStatus, SessionLifecycle};
use happy_core::now_ms;
use uuid::Uuid;

use crate::connection::{ConnectionPool, PooledConnection};
use crate::errors::{Result, StoreError};
use crate::repositories::{AccountRepo, MachineRepo, MessageRepo, SessionRepo, UpdateRepo};
use crate::row_types::{AccountRow, MachineRow, MessageRow, SessionRow, UpdateRow};

/// Producer recorded on relay-authored presence updates.
pub const SERVER_PRODUCER: &str = "server";

/// One publish attempt.
#[derive(Clone, Debug)]
pub struct PublishRequest {
    /// Owning account.
    pub account_id: String,
    /// Publishing connection (echo-suppression key).
    pub producer: String,
    /// Target entity.
    pub entity: EntityRef,
    /// Optimistic concurrency guard.
    pub expected_version: u64,
    /// Idempotency key.
    pub local_id: String,
    /// Ciphertext patch; `None` for presence-only updates.
    pub body: Option<String>,
    /// Cleartext daemon-state tag (machine entities).
    pub machine_status: Option<MachineStatus>,
    /// Cleartext lifecycle tag (session entities).
    pub lifecycle: Option<SessionLifecycle>,
}

/// Result of a publish attempt. Conflicts are outcomes, not errors.
#[derive(Clone, Debug, PartialEq)]
pub enum PublishOutcome {
    /// Persisted; fan out to subscribers.
    Committed {
        /// The stored row (carries seq, version, producer).
        update: UpdateRow,
    },
    /// A publish with this `(entity, localId)` already landed; nothing
    /// was written.
    Duplicate {
        /// Seq of the original update.
        seq: u64,
        /// Version the original update produced.
        version: u64,
    },
    /// `expectedVersion` was stale.
    VersionMismatch {
        /// Authoritative version.
        current_version: u64,
        /// Authoritative head body (still ciphertext).
        current_body: Option<String>,
    },
}

/// Result of a message append.
#[derive(Clone, Debug, PartialEq)]
pub enum MessageOutcome {
    /// Appended; fan out to subscribers.
    Appended {
        /// The stored row.
        message: MessageRow,
    },
    /// An append with this `(session, localId)` already landed; the
    /// original row wins (idempotent retry).
    Duplicate {
        /// The original row.
        message: MessageRow,
    },
    /// The session is archived; its log is immutable.
    Archived,
}

/// Result of a replay request.
#[derive(Clone, Debug, PartialEq)]
pub enum Replay {
    /// Updates with `seq > since_seq`, in order.
    Updates(Vec<UpdateRow>),
    /// The cursor predates the retention horizon; a snapshot refetch is
    /// required.
    ResyncRequired {
        /// Oldest retained seq.
        min_seq: u64,
    },
}

/// The store behind the relay.
pub struct RelayStore {
    pool: ConnectionPool,
}

impl RelayStore {
    /// Create a store over the given pool.
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> Result<PooledConnection> {
        Ok(self.pool.get()?)
    }

    // ─────────────────────────────────────────────────────────────────
    // Accounts
    // ─────────────────────────────────────────────────────────────────

    /// Provision an account for a bearer token.
    pub fn create_account(&self, token: &str) -> Result<AccountRow> {
        let conn = self.conn()?;
        AccountRepo::create(&conn, token, now_ms())
    }

    /// Resolve a bearer token to its account.
    pub fn account_by_token(&self, token: &str) -> Result<Option<AccountRow>> {
        let conn = self.conn()?;
        AccountRepo::get_by_token(&conn, token)
    }

    /// Fetch an account by id.
    pub fn get_account(&self, id: &str) -> Result<Option<AccountRow>> {
        let conn = self.conn()?;
        AccountRepo::get(&conn, id)
    }

    /// Ids of all accounts (retention sweep).
    pub fn account_ids(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        AccountRepo::list_ids(&conn)
    }

    /// Highest assigned update seq for an account.
    pub fn current_seq(&self, account_id: &str) -> Result<u64> {
        let conn = self.conn()?;
        let acct = AccountRepo::get(&conn, account_id)?.ok_or_else(|| StoreError::NotFound {
            kind: "account",
            id: account_id.into(),
        })?;
        Ok(acct.last_seq)
    }

    // ─────────────────────────────────────────────────────────────────
    // Machines / sessions
    // ─────────────────────────────────────────────────────────────────

    /// Get or create a machine row.
    pub fn get_or_create_machine(&self, account_id: &str, machine_id: &str) -> Result<MachineRow> {
        let conn = self.conn()?;
        MachineRepo::get_or_create(&conn, account_id, machine_id, now_ms())
    }

    /// All machines of an account.
    pub fn list_machines(&self, account_id: &str) -> Result<Vec<MachineRow>> {
        let conn = self.conn()?;
        MachineRepo::list(&conn, account_id)
    }

    /// Get or create a session for a client tag (idempotent on tag).
    pub fn create_session(&self, account_id: &str, tag: &str) -> Result<SessionRow> {
        let conn = self.conn()?;
        SessionRepo::get_or_create(&conn, account_id, tag, now_ms())
    }

    /// Fetch a session by id.
    pub fn get_session(&self, account_id: &str, session_id: &str) -> Result<Option<SessionRow>> {
        let conn = self.conn()?;
        SessionRepo::get(&conn, account_id, session_id)
    }

    /// All sessions of an account, newest first.
    pub fn list_sessions(&self, account_id: &str) -> Result<Vec<SessionRow>> {
        let conn = self.conn()?;
        SessionRepo::list(&conn, account_id)
    }

    /// Non-archived sessions across all accounts (health reporting).
    pub fn running_session_count(&self) -> Result<u64> {
        let conn = self.conn()?;
        SessionRepo::count_running(&conn)
    }

    // ─────────────────────────────────────────────────────────────────
    // Update log
    // ─────────────────────────────────────────────────────────────────

    /// Publish one versioned update atomically.
    ///
    /// Dedup check, version check, seq assignment, log insert and head
    /// update all commit in one transaction.
    pub fn publish_update(&self, req: &PublishRequest) -> Result<PublishOutcome> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let now = now_ms();

        // Idempotent retry: the first publish with this localId wins.
        if let Some(existing) = UpdateRepo::get_by_local_id(
            &tx,
            &req.account_id,
            req.entity.kind,
            &req.entity.id,
            &req.local_id,
        )? {
            tx.commit()?;
            return Ok(PublishOutcome::Duplicate {
                seq: existing.seq,
                version: existing.version,
            });
        }

        // Resolve current version + head body of the target entity.
        let (current_version, current_body) = match req.entity.kind {
            EntityKind::Account => {
                let acct = AccountRepo::get(&tx, &req.entity.id)?.ok_or_else(|| {
                    StoreError::NotFound {
                        kind: "account",
                        id: req.entity.id.clone(),
                    }
                })?;
                (acct.version, acct.head_body)
            }
            EntityKind::Machine => {
                let machine =
                    MachineRepo::get_or_create(&tx, &req.account_id, &req.entity.id, now)?;
                (machine.version, machine.head_body)
            }
            EntityKind::Session => {
                let session = SessionRepo::get(&tx, &req.account_id, &req.entity.id)?
                    .ok_or_else(|| StoreError::NotFound {
                        kind: "session",
                        id: req.entity.id.clone(),
                    })?;
                (session.version, session.head_body)
            }
        };

        if req.expected_version != current_version {
            tx.commit()?;
            return Ok(PublishOutcome::VersionMismatch {
                current_version,
                current_body,
            });
        }

        let seq = AccountRepo::next_seq(&tx, &req.account_id, now)?;
        let new_version = current_version + 1;

        let row = UpdateRow {
            account_id: req.account_id.clone(),
            seq,
            entity_kind: req.entity.kind,
            entity_id: req.entity.id.clone(),
            version: new_version,
            local_id: req.local_id.clone(),
            producer: req.producer.clone(),
            body: req.body.clone(),
            machine_status: req.machine_status,
            lifecycle: req.lifecycle,
            created_at: now,
        };
        UpdateRepo::insert(&tx, &row)?;

        match req.entity.kind {
            EntityKind::Account => AccountRepo::set_head(
                &tx,
                &req.entity.id,
                new_version,
                req.body.as_deref(),
                now,
            )?,
            EntityKind::Machine => MachineRepo::set_head(
                &tx,
                &req.account_id,
                &req.entity.id,
                new_version,
                req.body.as_deref(),
                req.machine_status,
                now,
            )?,
            EntityKind::Session => SessionRepo::set_head(
                &tx,
                &req.account_id,
                &req.entity.id,
                new_version,
                req.body.as_deref(),
                req.lifecycle,
                now,
            )?,
        }

        tx.commit()?;
        Ok(PublishOutcome::Committed { update: row })
    }

    /// Publish a relay-authored machine presence transition.
    ///
    /// Runs as a normal versioned update (so subscribers observe it as a
    /// persistent update) but never conflicts: the current version is
    /// read inside the transaction.
    pub fn set_machine_status(
        &self,
        account_id: &str,
        machine_id: &str,
        status: MachineStatus,
    ) -> Result<PublishOutcome> {
        let current = {
            let conn = self.conn()?;
            MachineRepo::get_or_create(&conn, account_id, machine_id, now_ms())?
        };
        if current.status == status {
            // Idempotent: no update row for a no-op transition.
            return Ok(PublishOutcome::Duplicate {
                seq: 0,
                version: current.version,
            });
        }
        self.publish_update(&PublishRequest {
            account_id: account_id.into(),
            producer: SERVER_PRODUCER.into(),
            entity: EntityRef::machine(machine_id),
            expected_version: current.version,
            local_id: Uuid::now_v7().to_string(),
            body: None,
            machine_status: Some(status),
            lifecycle: None,
        })
    }

    /// Replay retained updates after `since_seq`, or demand a resync if
    /// the cursor predates the retention horizon.
    pub fn updates_since(&self, account_id: &str, since_seq: u64) -> Result<Replay> {
        let conn = self.conn()?;
        let acct = AccountRepo::get(&conn, account_id)?.ok_or_else(|| StoreError::NotFound {
            kind: "account",
            id: account_id.into(),
        })?;
        if since_seq < acct.horizon_seq {
            return Ok(Replay::ResyncRequired {
                min_seq: acct.horizon_seq,
            });
        }
        Ok(Replay::Updates(UpdateRepo::list_since(
            &conn, account_id, since_seq,
        )?))
    }

    /// Drop updates so that at most `retain` of the newest remain; raises
    /// the horizon accordingly. Subscribers whose cursor falls below the
    /// new horizon will be told to resync.
    pub fn prune_updates(&self, account_id: &str, retain: u64) -> Result<usize> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let acct = AccountRepo::get(&tx, account_id)?.ok_or_else(|| StoreError::NotFound {
            kind: "account",
            id: account_id.into(),
        })?;
        let horizon = acct.last_seq.saturating_sub(retain);
        if horizon <= acct.horizon_seq {
            tx.commit()?;
            return Ok(0);
        }
        let pruned = UpdateRepo::prune_through(&tx, account_id, horizon)?;
        AccountRepo::set_horizon(&tx, account_id, horizon)?;
        tx.commit()?;
        Ok(pruned)
    }

    // ─────────────────────────────────────────────────────────────────
    // Message log
    // ─────────────────────────────────────────────────────────────────

    /// Append one message to a session log atomically.
    pub fn append_message(
        &self,
        account_id: &str,
        session_id: &str,
        producer: &str,
        local_id: &str,
        body: &str,
    ) -> Result<MessageOutcome> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let now = now_ms();

        let session = SessionRepo::get(&tx, account_id, session_id)?.ok_or_else(|| {
            StoreError::NotFound {
                kind: "session",
                id: session_id.into(),
            }
        })?;
        if session.lifecycle == SessionLifecycle::Archived {
            tx.commit()?;
            return Ok(MessageOutcome::Archived);
        }

        if let Some(existing) = MessageRepo::get_by_local_id(&tx, account_id, session_id, local_id)?
        {
            tx.commit()?;
            return Ok(MessageOutcome::Duplicate { message: existing });
        }

        let seq = SessionRepo::next_message_seq(&tx, account_id, session_id, now)?;
        let row = MessageRow {
            account_id: account_id.into(),
            session_id: session_id.into(),
            seq,
            id: Uuid::now_v7().to_string(),
            local_id: local_id.into(),
            producer: producer.into(),
            body: body.into(),
            created_at: now,
        };
        MessageRepo::insert(&tx, &row)?;
        tx.commit()?;
        Ok(MessageOutcome::Appended { message: row })
    }

    /// Messages of a session with `seq > since_seq`.
    pub fn messages_since(
        &self,
        account_id: &str,
        session_id: &str,
        since_seq: u64,
    ) -> Result<Vec<MessageRow>> {
        let conn = self.conn()?;
        MessageRepo::list_since(&conn, account_id, session_id, since_seq)
    }
}
