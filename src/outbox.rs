//! Durable outbox of remote ticket commands.
//!
//! Entries are appended in the order the UI issues commands and drained in
//! that same order by the flusher. That FIFO order is what puts a ticket's
//! creation ahead of its lines and payment; nothing here reorders entries or
//! requeues them at the back.
//!
//! Lifecycle of an entry:
//! - `enqueue`: inserted `pending` with `try_count = 0`
//! - `record_failure`: retryable remote error, `try_count + 1`, stays in place
//! - `dead_letter`: terminal remote error, parked until someone requeues or purges it
//! - `acknowledge`: remote confirmed, row deleted
//!
//! The idempotency key is written once at insert time; no statement in this
//! module updates it.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::device::DeviceContext;
use crate::error::{OutboxError, Result};
use crate::idempotency::{self, CommandKind, KEY_SCHEME_VERSION};
use crate::mapping;

/// Command payload, one variant per remote operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Command {
    CreateTicket,
    #[serde(rename_all = "camelCase")]
    AddLine { menu_item_id: String, qty: i64 },
    PayCash,
    /// Alternate payment; the payload is passed through untouched.
    PayMock {
        #[serde(default)]
        payload: Value,
    },
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::CreateTicket => CommandKind::CreateTicket,
            Command::AddLine { .. } => CommandKind::AddLine,
            Command::PayCash => CommandKind::PayCash,
            Command::PayMock { .. } => CommandKind::PayMock,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    DeadLetter,
}

impl EntryStatus {
    fn as_str(self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::DeadLetter => "dead_letter",
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "pending" => Ok(EntryStatus::Pending),
            "dead_letter" => Ok(EntryStatus::DeadLetter),
            other => Err(OutboxError::InvalidStoredValue {
                field: "outbox.status",
                value: other.to_string(),
            }),
        }
    }
}

/// A command to enqueue, before it has an id or key.
#[derive(Debug, Clone)]
pub struct NewCommand {
    pub local_ticket_id: String,
    pub part_id: Option<String>,
    pub command: Command,
    pub version: u32,
}

impl NewCommand {
    pub fn new(local_ticket_id: impl Into<String>, command: Command) -> Self {
        Self {
            local_ticket_id: local_ticket_id.into(),
            part_id: None,
            command,
            version: KEY_SCHEME_VERSION,
        }
    }

    pub fn with_part(mut self, part_id: impl Into<String>) -> Self {
        self.part_id = Some(part_id.into());
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    pub id: String,
    pub seq: i64,
    pub kind: CommandKind,
    pub idempotency_key: String,
    pub command: Command,
    pub local_ticket_id: String,
    pub part_id: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub try_count: i64,
    pub last_error: Option<String>,
    pub status: EntryStatus,
    pub dead_lettered_at: Option<DateTime<Utc>>,
}

const ENTRY_COLUMNS: &str = "seq, id, kind, idempotency_key, payload, local_ticket_id, part_id, \
     enqueued_at, try_count, last_error, status, dead_lettered_at";

fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Append a command to the outbox.
///
/// The key is derived from `ctx` before anything is written, so a missing
/// device context fails here and the command never enters the queue. The
/// row is committed when this returns (or when the caller's transaction
/// commits, if `conn` is a transaction).
///
/// Enqueuing the same logical operation twice while the first entry is still
/// queued returns the existing entry instead of a duplicate.
pub fn enqueue(conn: &Connection, ctx: &DeviceContext, cmd: NewCommand) -> Result<OutboxEntry> {
    let kind = cmd.command.kind();
    let key = idempotency::derive_key(
        ctx,
        kind,
        &cmd.local_ticket_id,
        cmd.part_id.as_deref(),
        cmd.version,
    )?;
    let payload = serde_json::to_string(&cmd.command)?;
    let id = Uuid::new_v4().to_string();

    let inserted = conn.execute(
        "INSERT INTO outbox (id, kind, idempotency_key, payload, local_ticket_id, part_id,
                             enqueued_at, try_count, last_error, status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, NULL, 'pending')
         ON CONFLICT(idempotency_key) DO NOTHING",
        params![
            id,
            kind.as_str(),
            key,
            payload,
            cmd.local_ticket_id,
            cmd.part_id,
            now_timestamp(),
        ],
    )?;

    let entry = find_by_key(conn, &key)?.ok_or_else(|| OutboxError::EntryNotFound(id.clone()))?;
    if inserted == 0 {
        info!(
            entry_id = %entry.id,
            idempotency_key = %key,
            "enqueue deduplicated via idempotency key"
        );
    } else {
        debug!(
            entry_id = %entry.id,
            kind = %kind,
            local_ticket_id = %entry.local_ticket_id,
            "command enqueued"
        );
    }
    Ok(entry)
}

pub fn get(conn: &Connection, id: &str) -> Result<Option<OutboxEntry>> {
    let raw = conn
        .query_row(
            &format!("SELECT {ENTRY_COLUMNS} FROM outbox WHERE id = ?1"),
            params![id],
            RawEntry::from_row,
        )
        .optional()?;
    raw.map(RawEntry::into_entry).transpose()
}

pub fn find_by_key(conn: &Connection, idempotency_key: &str) -> Result<Option<OutboxEntry>> {
    let raw = conn
        .query_row(
            &format!("SELECT {ENTRY_COLUMNS} FROM outbox WHERE idempotency_key = ?1"),
            params![idempotency_key],
            RawEntry::from_row,
        )
        .optional()?;
    raw.map(RawEntry::into_entry).transpose()
}

/// All pending entries, oldest first.
pub fn list_pending(conn: &Connection) -> Result<Vec<OutboxEntry>> {
    list_by_status(conn, EntryStatus::Pending)
}

/// Entries parked after a terminal rejection, oldest first.
pub fn list_dead_letters(conn: &Connection) -> Result<Vec<OutboxEntry>> {
    list_by_status(conn, EntryStatus::DeadLetter)
}

fn list_by_status(conn: &Connection, status: EntryStatus) -> Result<Vec<OutboxEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ENTRY_COLUMNS} FROM outbox WHERE status = ?1 ORDER BY enqueued_at, seq"
    ))?;
    let rows = stmt.query_map(params![status.as_str()], RawEntry::from_row)?;
    rows.map(|raw| raw.map_err(OutboxError::from).and_then(RawEntry::into_entry))
        .collect()
}

/// Entries of one ticket in queue order, any status.
pub fn list_for_ticket(conn: &Connection, local_ticket_id: &str) -> Result<Vec<OutboxEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ENTRY_COLUMNS} FROM outbox WHERE local_ticket_id = ?1 ORDER BY enqueued_at, seq"
    ))?;
    let rows = stmt.query_map(params![local_ticket_id], RawEntry::from_row)?;
    rows.map(|raw| raw.map_err(OutboxError::from).and_then(RawEntry::into_entry))
        .collect()
}

/// Retryable failure: bump the try count and keep the entry where it is.
pub fn record_failure(conn: &Connection, id: &str, error: &str) -> Result<()> {
    let changed = conn.execute(
        "UPDATE outbox SET try_count = try_count + 1, last_error = ?2 WHERE id = ?1",
        params![id, error],
    )?;
    if changed == 0 {
        return Err(OutboxError::EntryNotFound(id.to_string()));
    }
    Ok(())
}

/// Remote confirmed the command: remove the entry.
pub fn acknowledge(conn: &Connection, id: &str) -> Result<()> {
    let changed = conn.execute("DELETE FROM outbox WHERE id = ?1", params![id])?;
    if changed == 0 {
        return Err(OutboxError::EntryNotFound(id.to_string()));
    }
    Ok(())
}

/// Terminal failure: park the entry so it stops retrying.
pub fn dead_letter(conn: &Connection, id: &str, error: &str) -> Result<()> {
    let changed = conn.execute(
        "UPDATE outbox
         SET try_count = try_count + 1,
             last_error = ?2,
             status = 'dead_letter',
             dead_lettered_at = ?3
         WHERE id = ?1",
        params![id, error, now_timestamp()],
    )?;
    if changed == 0 {
        return Err(OutboxError::EntryNotFound(id.to_string()));
    }
    warn!(entry_id = id, error, "outbox entry dead-lettered");
    Ok(())
}

/// Put a dead-lettered entry back in the queue at its original position,
/// with the same key, and a clean retry history.
pub fn requeue_dead_letter(conn: &Connection, id: &str) -> Result<()> {
    let changed = conn.execute(
        "UPDATE outbox
         SET status = 'pending',
             try_count = 0,
             last_error = NULL,
             dead_lettered_at = NULL
         WHERE id = ?1 AND status = 'dead_letter'",
        params![id],
    )?;
    if changed == 0 {
        return Err(OutboxError::EntryNotFound(id.to_string()));
    }
    info!(entry_id = id, "dead-lettered entry requeued");
    Ok(())
}

/// Manually drop an entry without dispatching it.
pub fn purge(conn: &Connection, id: &str) -> Result<()> {
    let changed = conn.execute("DELETE FROM outbox WHERE id = ?1", params![id])?;
    if changed == 0 {
        return Err(OutboxError::EntryNotFound(id.to_string()));
    }
    warn!(entry_id = id, "outbox entry purged without dispatch");
    Ok(())
}

// ---------------------------------------------------------------------------
// Sync status (read by the UI)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub pending: i64,
    /// Pending entries that have failed at least once.
    pub retrying: i64,
    pub dead_letters: i64,
    pub oldest_pending_at: Option<String>,
}

pub fn sync_status(conn: &Connection) -> Result<SyncStatus> {
    let status = conn.query_row(
        "SELECT
            COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN status = 'pending' AND try_count > 0 THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN status = 'dead_letter' THEN 1 ELSE 0 END), 0),
            MIN(CASE WHEN status = 'pending' THEN enqueued_at END)
         FROM outbox",
        [],
        |row| {
            Ok(SyncStatus {
                pending: row.get(0)?,
                retrying: row.get(1)?,
                dead_letters: row.get(2)?,
                oldest_pending_at: row.get(3)?,
            })
        },
    )?;
    Ok(status)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketSyncStatus {
    pub local_ticket_id: String,
    pub server_ticket_id: Option<String>,
    pub pending: i64,
    pub dead_letters: i64,
    pub max_try_count: i64,
    /// Error of the first entry that is holding the ticket back.
    pub last_error: Option<String>,
    /// Nothing left in the outbox for this ticket.
    pub synced: bool,
}

pub fn ticket_sync_status(conn: &Connection, local_ticket_id: &str) -> Result<TicketSyncStatus> {
    let entries = list_for_ticket(conn, local_ticket_id)?;
    let pending = entries
        .iter()
        .filter(|e| e.status == EntryStatus::Pending)
        .count() as i64;
    let dead_letters = entries.len() as i64 - pending;
    let max_try_count = entries.iter().map(|e| e.try_count).max().unwrap_or(0);
    let last_error = entries.iter().find_map(|e| e.last_error.clone());

    Ok(TicketSyncStatus {
        local_ticket_id: local_ticket_id.to_string(),
        server_ticket_id: mapping::get(conn, local_ticket_id)?,
        pending,
        dead_letters,
        max_try_count,
        last_error,
        synced: entries.is_empty(),
    })
}

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

struct RawEntry {
    seq: i64,
    id: String,
    kind: String,
    idempotency_key: String,
    payload: String,
    local_ticket_id: String,
    part_id: Option<String>,
    enqueued_at: String,
    try_count: i64,
    last_error: Option<String>,
    status: String,
    dead_lettered_at: Option<String>,
}

impl RawEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            id: row.get(1)?,
            kind: row.get(2)?,
            idempotency_key: row.get(3)?,
            payload: row.get(4)?,
            local_ticket_id: row.get(5)?,
            part_id: row.get(6)?,
            enqueued_at: row.get(7)?,
            try_count: row.get(8)?,
            last_error: row.get(9)?,
            status: row.get(10)?,
            dead_lettered_at: row.get(11)?,
        })
    }

    fn into_entry(self) -> Result<OutboxEntry> {
        let kind: CommandKind = self.kind.parse()?;
        let command: Command = serde_json::from_str(&self.payload)?;
        if command.kind() != kind {
            return Err(OutboxError::InvalidStoredValue {
                field: "outbox.payload",
                value: self.payload,
            });
        }
        Ok(OutboxEntry {
            id: self.id,
            seq: self.seq,
            kind,
            idempotency_key: self.idempotency_key,
            command,
            local_ticket_id: self.local_ticket_id,
            part_id: self.part_id,
            enqueued_at: parse_timestamp("outbox.enqueued_at", &self.enqueued_at)?,
            try_count: self.try_count,
            last_error: self.last_error,
            status: EntryStatus::parse(&self.status)?,
            dead_lettered_at: self
                .dead_lettered_at
                .as_deref()
                .map(|raw| parse_timestamp("outbox.dead_lettered_at", raw))
                .transpose()?,
        })
    }
}

fn parse_timestamp(field: &'static str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| OutboxError::InvalidStoredValue {
            field,
            value: raw.to_string(),
        })
}
