//! Session message log repository.

use rusqlite::{params, Connection, OptionalExtension};

use crate::errors::Result;
use crate::row_types::MessageRow;

/// Message repository — stateless, every method takes `&Connection`.
pub struct MessageRepo;

const SELECT_COLS: &str =
    "account_id, session_id, seq, id, local_id, producer, body, created_at";

impl MessageRepo {
    /// Insert one message row. Seq must already be assigned.
    pub fn insert(conn: &Connection, row: &MessageRow) -> Result<()> {
        let _ = conn.execute(
            "INSERT INTO messages (account_id, session_id, seq, id, local_id, producer, body,
                                   created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                row.account_id,
                row.session_id,
                row.seq as i64,
                row.id,
                row.local_id,
                row.producer,
                row.body,
                row.created_at
            ],
        )?;
        Ok(())
    }

    /// Look up a prior append with the same `(session, local_id)`.
    pub fn get_by_local_id(
        conn: &Connection,
        account_id: &str,
        session_id: &str,
        local_id: &str,
    ) -> Result<Option<MessageRow>> {
        let row = conn
            .query_row(
                &format!(
                    "SELECT {SELECT_COLS} FROM messages
                     WHERE account_id = ?1 AND session_id = ?2 AND local_id = ?3"
                ),
                params![account_id, session_id, local_id],
                Self::map_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Messages with `seq > since_seq`, in log order.
    pub fn list_since(
        conn: &Connection,
        account_id: &str,
        session_id: &str,
        since_seq: u64,
    ) -> Result<Vec<MessageRow>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLS} FROM messages
             WHERE account_id = ?1 AND session_id = ?2 AND seq > ?3 ORDER BY seq"
        ))?;
        let rows = stmt
            .query_map(params![account_id, session_id, since_seq as i64], Self::map_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
        Ok(MessageRow {
            account_id: row.get(0)?,
            session_id: row.get(1)?,
            seq: row.get::<_, i64>(2)? as u64,
            id: row.get(3)?,
            local_id: row.get(4)?,
            producer: row.get(5)?,
            body: row.get(6)?,
            created_at: row.get(7)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{new_in_memory, ConnectionConfig};
    use crate::migrations::run_migrations;
    use crate::repositories::account::AccountRepo;
    use crate::repositories::session::SessionRepo;

    fn setup() -> (crate::connection::ConnectionPool, String, String) {
        let pool = new_in_memory(&ConnectionConfig::default()).unwrap();
        let (account_id, session_id) = {
            let conn = pool.get().unwrap();
            run_migrations(&conn).unwrap();
            let acct = AccountRepo::create(&conn, "tok", 1000).unwrap();
            let sess = SessionRepo::get_or_create(&conn, &acct.id, "tag", 1000).unwrap();
            (acct.id, sess.id)
        };
        (pool, account_id, session_id)
    }

    fn row(acct: &str, sess: &str, seq: u64, local_id: &str) -> MessageRow {
        MessageRow {
            account_id: acct.into(),
            session_id: sess.into(),
            seq,
            id: format!("m-{seq}"),
            local_id: local_id.into(),
            producer: "conn-1".into(),
            body: "Y2lwaGVy".into(),
            created_at: 1000 + seq as i64,
        }
    }

    #[test]
    fn insert_and_list() {
        let (pool, acct, sess) = setup();
        let conn = pool.get().unwrap();
        for seq in 1..=3 {
            MessageRepo::insert(&conn, &row(&acct, &sess, seq, &format!("l{seq}"))).unwrap();
        }
        let all = MessageRepo::list_since(&conn, &acct, &sess, 0).unwrap();
        assert_eq!(all.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn list_since_cursor() {
        let (pool, acct, sess) = setup();
        let conn = pool.get().unwrap();
        for seq in 1..=5 {
            MessageRepo::insert(&conn, &row(&acct, &sess, seq, &format!("l{seq}"))).unwrap();
        }
        let tail = MessageRepo::list_since(&conn, &acct, &sess, 4).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].seq, 5);
    }

    #[test]
    fn duplicate_local_id_rejected_by_index() {
        let (pool, acct, sess) = setup();
        let conn = pool.get().unwrap();
        MessageRepo::insert(&conn, &row(&acct, &sess, 1, "dup")).unwrap();
        assert!(MessageRepo::insert(&conn, &row(&acct, &sess, 2, "dup")).is_err());
    }

    #[test]
    fn local_id_lookup() {
        let (pool, acct, sess) = setup();
        let conn = pool.get().unwrap();
        MessageRepo::insert(&conn, &row(&acct, &sess, 1, "here")).unwrap();
        assert!(MessageRepo::get_by_local_id(&conn, &acct, &sess, "here")
            .unwrap()
            .is_some());
        assert!(MessageRepo::get_by_local_id(&conn, &acct, &sess, "gone")
            .unwrap()
            .is_none());
    }
}
