//! Update log repository.

use happy_core::entities::EntityKind;
use rusqlite::{params, Connection, OptionalExtension};

use crate::errors::Result;
use crate::row_types::{
    entity_kind_from_str, entity_kind_to_str, lifecycle_from_str, machine_status_from_str,
    UpdateRow,
};

/// Update repository — stateless, every method takes `&Connection`.
pub struct UpdateRepo;

const SELECT_COLS: &str = "account_id, seq, entity_kind, entity_id, version, local_id, \
                           producer, body, machine_status, lifecycle, created_at";

impl UpdateRepo {
    /// Insert one log row. Seq and version must already be assigned.
    pub fn insert(conn: &Connection, row: &UpdateRow) -> Result<()> {
        let _ = conn.execute(
            "INSERT INTO updates (account_id, seq, entity_kind, entity_id, version, local_id,
                                  producer, body, machine_status, lifecycle, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                row.account_id,
                row.seq as i64,
                entity_kind_to_str(row.entity_kind),
                row.entity_id,
                row.version as i64,
                row.local_id,
                row.producer,
                row.body,
                row.machine_status.map(crate::row_types::machine_status_to_str),
                row.lifecycle.map(crate::row_types::lifecycle_to_str),
                row.created_at
            ],
        )?;
        Ok(())
    }

    /// Look up a prior publish of the same `(entity, local_id)`.
    pub fn get_by_local_id(
        conn: &Connection,
        account_id: &str,
        entity_kind: EntityKind,
        entity_id: &str,
        local_id: &str,
    ) -> Result<Option<UpdateRow>> {
        let row = conn
            .query_row(
                &format!(
                    "SELECT {SELECT_COLS} FROM updates
                     WHERE account_id = ?1 AND entity_kind = ?2 AND entity_id = ?3 AND local_id = ?4"
                ),
                params![account_id, entity_kind_to_str(entity_kind), entity_id, local_id],
                Self::map_row,
            )
            .optional()?;
        Ok(row)
    }

    /// All retained updates with `seq > since_seq`, in seq order.
    pub fn list_since(conn: &Connection, account_id: &str, since_seq: u64) -> Result<Vec<UpdateRow>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLS} FROM updates
             WHERE account_id = ?1 AND seq > ?2 ORDER BY seq"
        ))?;
        let rows = stmt
            .query_map(params![account_id, since_seq as i64], Self::map_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Delete updates with `seq <= horizon_seq`.
    pub fn prune_through(conn: &Connection, account_id: &str, horizon_seq: u64) -> Result<usize> {
        let n = conn.execute(
            "DELETE FROM updates WHERE account_id = ?1 AND seq <= ?2",
            params![account_id, horizon_seq as i64],
        )?;
        Ok(n)
    }

    /// The head body of an entity as recorded by its latest update.
    pub fn latest_body_for_entity(
        conn: &Connection,
        account_id: &str,
        entity_kind: EntityKind,
        entity_id: &str,
    ) -> Result<Option<String>> {
        let body: Option<Option<String>> = conn
            .query_row(
                "SELECT body FROM updates
                 WHERE account_id = ?1 AND entity_kind = ?2 AND entity_id = ?3 AND body IS NOT NULL
                 ORDER BY seq DESC LIMIT 1",
                params![account_id, entity_kind_to_str(entity_kind), entity_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(body.flatten())
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UpdateRow> {
        let kind: String = row.get(2)?;
        let machine_status: Option<String> = row.get(8)?;
        let lifecycle: Option<String> = row.get(9)?;
        Ok(UpdateRow {
            account_id: row.get(0)?,
            seq: row.get::<_, i64>(1)? as u64,
            entity_kind: entity_kind_from_str(&kind),
            entity_id: row.get(3)?,
            version: row.get::<_, i64>(4)? as u64,
            local_id: row.get(5)?,
            producer: row.get(6)?,
            body: row.get(7)?,
            machine_status: machine_status.as_deref().map(machine_status_from_str),
            lifecycle: lifecycle.as_deref().map(lifecycle_from_str),
            created_at: row.get(10)?,
        })
    }
}
