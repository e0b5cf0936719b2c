//! Local ticket id → server ticket id.
//!
//! Written exactly once per ticket, by the flusher, when the remote
//! acknowledges ticket creation. Every dependent command reads it to learn
//! which server ticket to address.

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, error};

use crate::error::{OutboxError, Result};
use crate::tickets;

pub fn get(conn: &Connection, local_ticket_id: &str) -> Result<Option<String>> {
    let server_id: Option<Option<String>> = conn
        .query_row(
            "SELECT server_ticket_id FROM mapping WHERE local_ticket_id = ?1",
            params![local_ticket_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(server_id.flatten())
}

/// Record the server id for a ticket.
///
/// Setting the same value again is a no-op. Setting a different value is a
/// protocol bug and returns [`OutboxError::MappingConflict`] without
/// touching the stored mapping.
pub fn set(conn: &Connection, local_ticket_id: &str, server_ticket_id: &str) -> Result<()> {
    if let Some(existing) = get(conn, local_ticket_id)? {
        if existing == server_ticket_id {
            debug!(local_ticket_id, server_ticket_id, "mapping already set");
            return Ok(());
        }
        error!(
            local_ticket_id,
            existing = %existing,
            attempted = server_ticket_id,
            "refusing to remap ticket to a different server id"
        );
        return Err(OutboxError::MappingConflict {
            local_ticket_id: local_ticket_id.to_string(),
            existing,
            attempted: server_ticket_id.to_string(),
        });
    }

    conn.execute(
        "INSERT INTO mapping (local_ticket_id, server_ticket_id, mapped_at)
         VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(local_ticket_id) DO UPDATE SET
            server_ticket_id = excluded.server_ticket_id,
            mapped_at = excluded.mapped_at
         WHERE mapping.server_ticket_id IS NULL",
        params![local_ticket_id, server_ticket_id],
    )?;

    if !tickets::set_server_id(conn, local_ticket_id, server_ticket_id)? {
        debug!(local_ticket_id, "mapped ticket has no local row");
    }
    Ok(())
}
