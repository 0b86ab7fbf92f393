//! Session repository.

use happy_core::entities::SessionLifecycle;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::errors::Result;
use crate::row_types::{lifecycle_from_str, lifecycle_to_str, SessionRow};

/// Session repository — stateless, every method takes `&Connection`.
pub struct SessionRepo;

impl SessionRepo {
    /// Create a session for the given client tag, or return the existing
    /// one — creation is idempotent on `(account, tag)` so a CLI retry
    /// after a dropped response never forks a sibling session.
    pub fn get_or_create(
        conn: &Connection,
        account_id: &str,
        tag: &str,
        now: i64,
    ) -> Result<SessionRow> {
        if let Some(existing) = Self::get_by_tag(conn, account_id, tag)? {
            return Ok(existing);
        }
        let id = Uuid::now_v7().to_string();
        let _ = conn.execute(
            "INSERT INTO sessions (id, account_id, tag, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![id, account_id, tag, now],
        )?;
        Ok(Self::get(conn, account_id, &id)?.expect("freshly inserted session"))
    }

    /// Fetch by id.
    pub fn get(conn: &Connection, account_id: &str, session_id: &str) -> Result<Option<SessionRow>> {
        let row = conn
            .query_row(
                "SELECT id, account_id, tag, created_at, updated_at, version, head_body,
                        lifecycle, last_message_seq
                 FROM sessions WHERE account_id = ?1 AND id = ?2",
                params![account_id, session_id],
                Self::map_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Fetch by creation tag.
    pub fn get_by_tag(conn: &Connection, account_id: &str, tag: &str) -> Result<Option<SessionRow>> {
        let row = conn
            .query_row(
                "SELECT id, account_id, tag, created_at, updated_at, version, head_body,
                        lifecycle, last_message_seq
                 FROM sessions WHERE account_id = ?1 AND tag = ?2",
                params![account_id, tag],
                Self::map_row,
            )
            .optional()?;
        Ok(row)
    }

    /// All sessions of an account, newest first.
    pub fn list(conn: &Connection, account_id: &str) -> Result<Vec<SessionRow>> {
        let mut stmt = conn.prepare(
            "SELECT id, account_id, tag, created_at, updated_at, version, head_body,
                    lifecycle, last_message_seq
             FROM sessions WHERE account_id = ?1 ORDER BY created_at DESC",
        )?;
        let rows = stmt
            .query_map(params![account_id], Self::map_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Apply an accepted update: bump version, replace head body and/or
    /// lifecycle.
    pub fn set_head(
        conn: &Connection,
        account_id: &str,
        session_id: &str,
        version: u64,
        body: Option<&str>,
        lifecycle: Option<SessionLifecycle>,
        now: i64,
    ) -> Result<()> {
        let _ = conn.execute(
            "UPDATE sessions SET version = ?3,
                 head_body = COALESCE(?4, head_body),
                 lifecycle = COALESCE(?5, lifecycle),
                 updated_at = ?6
             WHERE account_id = ?1 AND id = ?2",
            params![
                account_id,
                session_id,
                version as i64,
                body,
                lifecycle.map(lifecycle_to_str),
                now
            ],
        )?;
        Ok(())
    }

    /// Number of non-archived sessions across all accounts.
    pub fn count_running(conn: &Connection) -> Result<u64> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sessions WHERE lifecycle = 'running'",
            [],
            |r| r.get(0),
        )?;
        Ok(count as u64)
    }

    /// Advance and return the next message seq for a session. Must run
    /// inside the append transaction.
    pub fn next_message_seq(
        conn: &Connection,
        account_id: &str,
        session_id: &str,
        now: i64,
    ) -> Result<u64> {
        let _ = conn.execute(
            "UPDATE sessions SET last_message_seq = last_message_seq + 1, updated_at = ?3
             WHERE account_id = ?1 AND id = ?2",
            params![account_id, session_id, now],
        )?;
        let seq: i64 = conn.query_row(
            "SELECT last_message_seq FROM sessions WHERE account_id = ?1 AND id = ?2",
            params![account_id, session_id],
            |r| r.get(0),
        )?;
        Ok(seq as u64)
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRow> {
        let lifecycle: String = row.get(7)?;
        Ok(SessionRow {
            id: row.get(0)?,
            account_id: row.get(1)?,
            tag: row.get(2)?,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
            version: row.get::<_, i64>(5)? as u64,
            head_body: row.get(6)?,
            lifecycle: lifecycle_from_str(&lifecycle),
            last_message_seq: row.get::<_, i64>(8)? as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{new_in_memory, ConnectionConfig};
    use crate::migrations::run_migrations;
    use crate::repositories::account::AccountRepo;

    fn setup() -> (crate::connection::ConnectionPool, String) {
        let pool = new_in_memory(&ConnectionConfig::default()).unwrap();
        let account_id = {
            let conn = pool.get().unwrap();
            run_migrations(&conn).unwrap();
            AccountRepo::create(&conn, "tok", 1000).unwrap().id
        };
        (pool, account_id)
    }

    #[test]
    fn create_by_tag_is_idempotent() {
        let (pool, acct) = setup();
        let conn = pool.get().unwrap();
        let a = SessionRepo::get_or_create(&conn, &acct, "tag-1", 1000).unwrap();
        let b = SessionRepo::get_or_create(&conn, &acct, "tag-1", 2000).unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(SessionRepo::list(&conn, &acct).unwrap().len(), 1);
    }

    #[test]
    fn new_session_is_running() {
        let (pool, acct) = setup();
        let conn = pool.get().unwrap();
        let s = SessionRepo::get_or_create(&conn, &acct, "tag-2", 1000).unwrap();
        assert_eq!(s.lifecycle, SessionLifecycle::Running);
        assert_eq!(s.version, 0);
        assert_eq!(s.last_message_seq, 0);
    }

    #[test]
    fn archive_via_set_head() {
        let (pool, acct) = setup();
        let conn = pool.get().unwrap();
        let s = SessionRepo::get_or_create(&conn, &acct, "tag-3", 1000).unwrap();
        SessionRepo::set_head(
            &conn,
            &acct,
            &s.id,
            1,
            None,
            Some(SessionLifecycle::Archived),
            1001,
        )
        .unwrap();
        let after = SessionRepo::get(&conn, &acct, &s.id).unwrap().unwrap();
        assert_eq!(after.lifecycle, SessionLifecycle::Archived);
    }

    #[test]
    fn message_seq_advances_per_session() {
        let (pool, acct) = setup();
        let conn = pool.get().unwrap();
        let a = SessionRepo::get_or_create(&conn, &acct, "tag-a", 1000).unwrap();
        let b = SessionRepo::get_or_create(&conn, &acct, "tag-b", 1000).unwrap();
        assert_eq!(SessionRepo::next_message_seq(&conn, &acct, &a.id, 1001).unwrap(), 1);
        assert_eq!(SessionRepo::next_message_seq(&conn, &acct, &a.id, 1002).unwrap(), 2);
        // Independent counter per session
        assert_eq!(SessionRepo::next_message_seq(&conn, &acct, &b.id, 1003).unwrap(), 1);
    }

    #[test]
    fn count_running_excludes_archived() {
        let (pool, acct) = setup();
        let conn = pool.get().unwrap();
        let a = SessionRepo::get_or_create(&conn, &acct, "tag-x", 1000).unwrap();
        let _ = SessionRepo::get_or_create(&conn, &acct, "tag-y", 1000).unwrap();
        assert_eq!(SessionRepo::count_running(&conn).unwrap(), 2);

        SessionRepo::set_head(
            &conn,
            &acct,
            &a.id,
            1,
            None,
            Some(SessionLifecycle::Archived),
            1001,
        )
        .unwrap();
        assert_eq!(SessionRepo::count_running(&conn).unwrap(), 1);
    }

    #[test]
    fn same_tag_different_accounts_are_distinct() {
        let (pool, acct) = setup();
        let conn = pool.get().unwrap();
        let other = AccountRepo::create(&conn, "tok-2", 1000).unwrap();
        let a = SessionRepo::get_or_create(&conn, &acct, "shared-tag", 1000).unwrap();
        let b = SessionRepo::get_or_create(&conn, &other.id, "shared-tag", 1000).unwrap();
        assert_ne!(a.id, b.id);
    }
}
