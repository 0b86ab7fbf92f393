//! Machine repository.

use happy_core::entities::MachineStatus;
use rusqlite::{params, Connection, OptionalExtension};

use crate::errors::Result;
use crate::row_types::{machine_status_from_str, machine_status_to_str, MachineRow};

/// Machine repository — stateless, every method takes `&Connection`.
pub struct MachineRepo;

impl MachineRepo {
    /// Insert a machine row if it doesn't exist yet; returns the row
    /// either way. The daemon derives the machine id from its
    /// (hostname, home-dir) identity, so a second boot reuses the row.
    pub fn get_or_create(
        conn: &Connection,
        account_id: &str,
        machine_id: &str,
        now: i64,
    ) -> Result<MachineRow> {
        let _ = conn.execute(
            "INSERT OR IGNORE INTO machines (id, account_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)",
            params![machine_id, account_id, now],
        )?;
        Ok(Self::get(conn, account_id, machine_id)?.expect("machine row upserted"))
    }

    /// Fetch by id.
    pub fn get(conn: &Connection, account_id: &str, machine_id: &str) -> Result<Option<MachineRow>> {
        let row = conn
            .query_row(
                "SELECT id, account_id, created_at, updated_at, version, head_body, status
                 FROM machines WHERE account_id = ?1 AND id = ?2",
                params![account_id, machine_id],
                Self::map_row,
            )
            .optional()?;
        Ok(row)
    }

    /// All machines of an account.
    pub fn list(conn: &Connection, account_id: &str) -> Result<Vec<MachineRow>> {
        let mut stmt = conn.prepare(
            "SELECT id, account_id, created_at, updated_at, version, head_body, status
             FROM machines WHERE account_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map(params![account_id], Self::map_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Apply an accepted update: bump version, replace head body and/or
    /// status.
    pub fn set_head(
        conn: &Connection,
        account_id: &str,
        machine_id: &str,
        version: u64,
        body: Option<&str>,
        status: Option<MachineStatus>,
        now: i64,
    ) -> Result<()> {
        let _ = conn.execute(
            "UPDATE machines SET version = ?3,
                 head_body = COALESCE(?4, head_body),
                 status = COALESCE(?5, status),
                 updated_at = ?6
             WHERE account_id = ?1 AND id = ?2",
            params![
                account_id,
                machine_id,
                version as i64,
                body,
                status.map(machine_status_to_str),
                now
            ],
        )?;
        Ok(())
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MachineRow> {
        let status: String = row.get(6)?;
        Ok(MachineRow {
            id: row.get(0)?,
            account_id: row.get(1)?,
            created_at: row.get(2)?,
            updated_at: row.get(3)?,
            version: row.get::<_, i64>(4)? as u64,
            head_body: row.get(5)?,
            status: machine_status_from_str(&status),
        })
    }
}
