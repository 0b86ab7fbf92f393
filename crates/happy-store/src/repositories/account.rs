//! Account repository — identity rows and the per-account seq counter.

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::errors::Result;
use crate::row_types::AccountRow;

/// Account repository — stateless, every method takes `&Connection`.
pub struct AccountRepo;

impl AccountRepo {
    /// Insert a new account with the given bearer token.
    pub fn create(conn: &Connection, token: &str, now: i64) -> Result<AccountRow> {
        let id = Uuid::now_v7().to_string();
        let _ = conn.execute(
            "INSERT INTO accounts (id, token, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
            params![id, token, now],
        )?;
        Ok(Self::get(conn, &id)?.expect("freshly inserted account"))
    }

    /// Fetch by id.
    pub fn get(conn: &Connection, id: &str) -> Result<Option<AccountRow>> {
        let row = conn
            .query_row(
                "SELECT id, created_at, updated_at, version, head_body, last_seq, horizon_seq
                 FROM accounts WHERE id = ?1",
                params![id],
                Self::map_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Fetch by bearer token.
    pub fn get_by_token(conn: &Connection, token: &str) -> Result<Option<AccountRow>> {
        let row = conn
            .query_row(
                "SELECT id, created_at, updated_at, version, head_body, last_seq, horizon_seq
                 FROM accounts WHERE token = ?1",
                params![token],
                Self::map_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Advance and return the next update seq. Must run inside the
    /// publish transaction so assignment is race-free.
    pub fn next_seq(conn: &Connection, id: &str, now: i64) -> Result<u64> {
        let _ = conn.execute(
            "UPDATE accounts SET last_seq = last_seq + 1, updated_at = ?2 WHERE id = ?1",
            params![id, now],
        )?;
        let seq: i64 = conn.query_row(
            "SELECT last_seq FROM accounts WHERE id = ?1",
            params![id],
            |r| r.get(0),
        )?;
        Ok(seq as u64)
    }

    /// Set the account record head after an accepted account update.
    pub fn set_head(
        conn: &Connection,
        id: &str,
        version: u64,
        body: Option<&str>,
        now: i64,
    ) -> Result<()> {
        let _ = conn.execute(
            "UPDATE accounts SET version = ?2, head_body = COALESCE(?3, head_body), updated_at = ?4
             WHERE id = ?1",
            params![id, version as i64, body, now],
        )?;
        Ok(())
    }

    /// Raise the retention horizon to `horizon_seq`.
    pub fn set_horizon(conn: &Connection, id: &str, horizon_seq: u64) -> Result<()> {
        let _ = conn.execute(
            "UPDATE accounts SET horizon_seq = ?2 WHERE id = ?1",
            params![id, horizon_seq as i64],
        )?;
        Ok(())
    }

    /// Ids of all accounts (retention sweep).
    pub fn list_ids(conn: &Connection) -> Result<Vec<String>> {
        let mut stmt = conn.prepare("SELECT id FROM accounts ORDER BY created_at")?;
        let ids = stmt
            .query_map([], |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AccountRow> {
        Ok(AccountRow {
            id: row.get(0)?,
            created_at: row.get(1)?,
            updated_at: row.get(2)?,
            version: row.get::<_, i64>(3)? as u64,
            head_body: row.get(4)?,
            last_seq: row.get::<_, i64>(5)? as u64,
            horizon_seq: row.get::<_, i64>(6)? as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{new_in_memory, ConnectionConfig};
    use crate::migrations::run_migrations;

    fn setup() -> crate::connection::ConnectionPool {
        let pool = new_in_memory(&ConnectionConfig::default()).unwrap();
        run_migrations(&pool.get().unwrap()).unwrap();
        pool
    }

    #[test]
    fn create_and_fetch_by_token() {
        let pool = setup();
        let conn = pool.get().unwrap();
        let created = AccountRepo::create(&conn, "tok-a", 1000).unwrap();
        let fetched = AccountRepo::get_by_token(&conn, "tok-a").unwrap().unwrap();
        assert_eq!(fetched.id, created.id);
        assert_eq!(fetched.last_seq, 0);
        assert_eq!(fetched.version, 0);
    }

    #[test]
    fn unknown_token_is_none() {
        let pool = setup();
        let conn = pool.get().unwrap();
        assert!(AccountRepo::get_by_token(&conn, "nope").unwrap().is_none());
    }

    #[test]
    fn duplicate_token_rejected() {
        let pool = setup();
        let conn = pool.get().unwrap();
        let _ = AccountRepo::create(&conn, "tok-b", 1000).unwrap();
        assert!(AccountRepo::create(&conn, "tok-b", 1001).is_err());
    }

    #[test]
    fn next_seq_is_monotonic() {
        let pool = setup();
        let conn = pool.get().unwrap();
        let acct = AccountRepo::create(&conn, "tok-c", 1000).unwrap();
        assert_eq!(AccountRepo::next_seq(&conn, &acct.id, 1001).unwrap(), 1);
        assert_eq!(AccountRepo::next_seq(&conn, &acct.id, 1002).unwrap(), 2);
        assert_eq!(AccountRepo::next_seq(&conn, &acct.id, 1003).unwrap(), 3);
    }

    #[test]
    fn horizon_starts_at_zero_and_raises() {
        let pool = setup();
        let conn = pool.get().unwrap();
        let acct = AccountRepo::create(&conn, "tok-d", 1000).unwrap();
        assert_eq!(acct.horizon_seq, 0);
        AccountRepo::set_horizon(&conn, &acct.id, 42).unwrap();
        let after = AccountRepo::get(&conn, &acct.id).unwrap().unwrap();
        assert_eq!(after.horizon_seq, 42);
    }
}
