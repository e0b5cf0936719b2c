//! Local ticket store.
//!
//! Tickets and their lines are written here first and stay the source of
//! truth until the remote confirms them. Creation is atomic: a ticket is
//! never visible without all of its lines, and vice versa.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{OutboxError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketStatus {
    Open,
    Paid,
}

impl TicketStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TicketStatus::Open => "open",
            TicketStatus::Paid => "paid",
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "open" => Ok(TicketStatus::Open),
            "paid" => Ok(TicketStatus::Paid),
            other => Err(OutboxError::InvalidStoredValue {
                field: "local_tickets.status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalTicket {
    pub local_id: String,
    pub server_id: Option<String>,
    pub status: TicketStatus,
    /// Minor currency units.
    pub total_amount: i64,
    pub created_at: DateTime<Utc>,
    pub business_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalLine {
    pub id: String,
    pub local_ticket_id: String,
    pub menu_item_id: String,
    pub qty: i64,
}

/// Write a ticket and all of its lines in one transaction.
pub fn create_local(conn: &mut Connection, ticket: &LocalTicket, lines: &[LocalLine]) -> Result<()> {
    let tx = conn.transaction()?;
    create_local_in(&tx, ticket, lines)?;
    tx.commit()?;
    info!(
        local_ticket_id = %ticket.local_id,
        lines = lines.len(),
        total_amount = ticket.total_amount,
        "local ticket created"
    );
    Ok(())
}

/// Same as [`create_local`] inside a caller-owned transaction, so the caller
/// can enqueue the matching outbox entries atomically with the ticket.
pub fn create_local_in(tx: &Transaction<'_>, ticket: &LocalTicket, lines: &[LocalLine]) -> Result<()> {
    tx.execute(
        "INSERT INTO local_tickets (local_id, server_id, status, total_amount, created_at, business_date)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            ticket.local_id,
            ticket.server_id,
            ticket.status.as_str(),
            ticket.total_amount,
            ticket.created_at.to_rfc3339(),
            ticket.business_date.format("%Y-%m-%d").to_string(),
        ],
    )?;

    let mut stmt = tx.prepare(
        "INSERT INTO local_lines (id, local_ticket_id, menu_item_id, qty)
         VALUES (?1, ?2, ?3, ?4)",
    )?;
    for line in lines {
        // Lines always belong to the ticket being created.
        stmt.execute(params![line.id, ticket.local_id, line.menu_item_id, line.qty])?;
    }
    Ok(())
}

/// Flip a ticket to `Paid`. Marking an already paid ticket is a no-op.
pub fn mark_paid(conn: &Connection, local_ticket_id: &str) -> Result<()> {
    let changed = conn.execute(
        "UPDATE local_tickets SET status = 'paid' WHERE local_id = ?1 AND status != 'paid'",
        params![local_ticket_id],
    )?;
    if changed == 0 {
        if !exists(conn, local_ticket_id)? {
            return Err(OutboxError::TicketNotFound(local_ticket_id.to_string()));
        }
        debug!(local_ticket_id, "ticket already paid");
    }
    Ok(())
}

/// Record the server id on the ticket once the mapping is known.
pub fn set_server_id(conn: &Connection, local_ticket_id: &str, server_id: &str) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE local_tickets SET server_id = ?2 WHERE local_id = ?1",
        params![local_ticket_id, server_id],
    )?;
    Ok(changed > 0)
}

pub fn exists(conn: &Connection, local_ticket_id: &str) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM local_tickets WHERE local_id = ?1",
            params![local_ticket_id],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn get(conn: &Connection, local_ticket_id: &str) -> Result<Option<LocalTicket>> {
    let raw = conn
        .query_row(
            "SELECT local_id, server_id, status, total_amount, created_at, business_date
             FROM local_tickets WHERE local_id = ?1",
            params![local_ticket_id],
            RawTicket::from_row,
        )
        .optional()?;
    raw.map(RawTicket::into_ticket).transpose()
}

pub fn lines_for(conn: &Connection, local_ticket_id: &str) -> Result<Vec<LocalLine>> {
    let mut stmt = conn.prepare(
        "SELECT id, local_ticket_id, menu_item_id, qty
         FROM local_lines WHERE local_ticket_id = ?1 ORDER BY rowid",
    )?;
    let rows = stmt.query_map(params![local_ticket_id], |row| {
        Ok(LocalLine {
            id: row.get(0)?,
            local_ticket_id: row.get(1)?,
            menu_item_id: row.get(2)?,
            qty: row.get(3)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Tickets of one business date, oldest first.
pub fn list_by_business_date(conn: &Connection, business_date: NaiveDate) -> Result<Vec<LocalTicket>> {
    let mut stmt = conn.prepare(
        "SELECT local_id, server_id, status, total_amount, created_at, business_date
         FROM local_tickets WHERE business_date = ?1 ORDER BY created_at, rowid",
    )?;
    let rows = stmt.query_map(
        params![business_date.format("%Y-%m-%d").to_string()],
        RawTicket::from_row,
    )?;
    rows.map(|raw| raw.map_err(OutboxError::from).and_then(RawTicket::into_ticket))
        .collect()
}

/// Row as stored, before text columns are parsed.
struct RawTicket {
    local_id: String,
    server_id: Option<String>,
    status: String,
    total_amount: i64,
    created_at: String,
    business_date: String,
}

impl RawTicket {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            local_id: row.get(0)?,
            server_id: row.get(1)?,
            status: row.get(2)?,
            total_amount: row.get(3)?,
            created_at: row.get(4)?,
            business_date: row.get(5)?,
        })
    }

    fn into_ticket(self) -> Result<LocalTicket> {
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| OutboxError::InvalidStoredValue {
                field: "local_tickets.created_at",
                value: self.created_at.clone(),
            })?;
        let business_date = NaiveDate::parse_from_str(&self.business_date, "%Y-%m-%d").map_err(
            |_| OutboxError::InvalidStoredValue {
                field: "local_tickets.business_date",
                value: self.business_date.clone(),
            },
        )?;
        Ok(LocalTicket {
            local_id: self.local_id,
            server_id: self.server_id,
            status: TicketStatus::parse(&self.status)?,
            total_amount: self.total_amount,
            created_at,
            business_date,
        })
    }
}
