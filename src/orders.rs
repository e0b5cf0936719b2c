//! Sale recording: the entry points the register screens call.
//!
//! Each call writes local state and enqueues the matching remote commands in
//! one SQLite transaction, so a ticket never exists locally without its
//! commands queued (or the reverse). A missing device context fails before
//! anything is written.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::db::DbState;
use crate::device::DeviceContext;
use crate::error::{OutboxError, Result};
use crate::idempotency::CommandKind;
use crate::outbox::{self, Command, NewCommand, OutboxEntry};
use crate::tickets::{self, LocalLine, LocalTicket, TicketStatus};

/// One cart line as the register hands it over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleLine {
    pub menu_item_id: String,
    pub qty: i64,
    /// Minor currency units.
    pub unit_price: i64,
}

#[derive(Debug, Clone)]
pub struct OpenedTicket {
    pub ticket: LocalTicket,
    pub lines: Vec<LocalLine>,
    /// CreateTicket first, then one AddLine per line, in queue order.
    pub entries: Vec<OutboxEntry>,
}

/// Record a new ticket offline and queue its creation and lines.
pub fn open_ticket(db: &DbState, ctx: &DeviceContext, sale: &[SaleLine]) -> Result<OpenedTicket> {
    let total_amount = sale_total(sale)?;
    let local_id = Uuid::new_v4().to_string();

    let ticket = LocalTicket {
        local_id: local_id.clone(),
        server_id: None,
        status: TicketStatus::Open,
        total_amount,
        created_at: Utc::now(),
        business_date: ctx.business_date(),
    };
    let lines: Vec<LocalLine> = sale
        .iter()
        .map(|line| LocalLine {
            id: Uuid::new_v4().to_string(),
            local_ticket_id: local_id.clone(),
            menu_item_id: line.menu_item_id.trim().to_string(),
            qty: line.qty,
        })
        .collect();

    let mut conn = db.lock()?;
    let tx = conn.transaction()?;
    tickets::create_local_in(&tx, &ticket, &lines)?;

    let mut entries = Vec::with_capacity(lines.len() + 1);
    entries.push(outbox::enqueue(
        &tx,
        ctx,
        NewCommand::new(&local_id, Command::CreateTicket),
    )?);
    for line in &lines {
        let cmd = NewCommand::new(
            &local_id,
            Command::AddLine {
                menu_item_id: line.menu_item_id.clone(),
                qty: line.qty,
            },
        )
        .with_part(&line.id);
        entries.push(outbox::enqueue(&tx, ctx, cmd)?);
    }
    tx.commit()?;

    info!(
        local_ticket_id = %local_id,
        lines = lines.len(),
        total_amount,
        "ticket opened offline"
    );
    Ok(OpenedTicket {
        ticket,
        lines,
        entries,
    })
}

/// Queue a cash payment for an open ticket.
pub fn pay_cash(db: &DbState, ctx: &DeviceContext, local_ticket_id: &str) -> Result<OutboxEntry> {
    enqueue_payment(db, ctx, local_ticket_id, Command::PayCash)
}

/// Queue the alternate payment variant; `payload` is forwarded as-is.
pub fn pay_mock(
    db: &DbState,
    ctx: &DeviceContext,
    local_ticket_id: &str,
    payload: Value,
) -> Result<OutboxEntry> {
    enqueue_payment(db, ctx, local_ticket_id, Command::PayMock { payload })
}

fn enqueue_payment(
    db: &DbState,
    ctx: &DeviceContext,
    local_ticket_id: &str,
    command: Command,
) -> Result<OutboxEntry> {
    let conn = db.lock()?;
    let ticket = tickets::get(&conn, local_ticket_id)?
        .ok_or_else(|| OutboxError::TicketNotFound(local_ticket_id.to_string()))?;
    if ticket.status == TicketStatus::Paid {
        return Err(OutboxError::InvalidInput(format!(
            "ticket {local_ticket_id} is already paid"
        )));
    }

    let kind = command.kind();
    // One payment per ticket. Re-queuing the same method returns the queued
    // entry through its idempotency key; a second method is refused.
    let queued_payment = outbox::list_for_ticket(&conn, local_ticket_id)?
        .into_iter()
        .find(|e| matches!(e.kind, CommandKind::PayCash | CommandKind::PayMock));
    if let Some(existing) = queued_payment {
        if existing.kind != kind {
            return Err(OutboxError::InvalidInput(format!(
                "ticket {local_ticket_id} already has a {} payment queued ({})",
                existing.kind, existing.id
            )));
        }
    }

    let entry = outbox::enqueue(&conn, ctx, NewCommand::new(local_ticket_id, command))?;
    info!(local_ticket_id, kind = %kind, entry_id = %entry.id, "payment queued");
    Ok(entry)
}

fn sale_total(sale: &[SaleLine]) -> Result<i64> {
    let mut total: i64 = 0;
    for line in sale {
        if line.menu_item_id.trim().is_empty() {
            return Err(OutboxError::InvalidInput("line without menu item".into()));
        }
        if line.qty <= 0 {
            return Err(OutboxError::InvalidInput(format!(
                "quantity must be positive for {}",
                line.menu_item_id
            )));
        }
        if line.unit_price < 0 {
            return Err(OutboxError::InvalidInput(format!(
                "negative price for {}",
                line.menu_item_id
            )));
        }
        total = line
            .qty
            .checked_mul(line.unit_price)
            .and_then(|amount| total.checked_add(amount))
            .ok_or_else(|| OutboxError::InvalidInput("ticket total overflows".into()))?;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_state;
    use chrono::NaiveDate;

    fn ctx() -> DeviceContext {
        DeviceContext::new("till-1", NaiveDate::from_ymd_opt(2026, 10, 17).unwrap()).unwrap()
    }

    fn sale() -> Vec<SaleLine> {
        vec![
            SaleLine {
                menu_item_id: "matcha".into(),
                qty: 2,
                unit_price: 57_500,
            },
            SaleLine {
                menu_item_id: "cookie".into(),
                qty: 3,
                unit_price: 22_500,
            },
        ]
    }

    #[test]
    fn test_open_ticket_writes_ticket_and_ordered_commands() {
        let db = test_state();
        let opened = open_ticket(&db, &ctx(), &sale()).unwrap();

        assert_eq!(opened.ticket.total_amount, 2 * 57_500 + 3 * 22_500);
        assert_eq!(opened.lines.len(), 2);

        let conn = db.lock().unwrap();
        let pending = outbox::list_pending(&conn).unwrap();
        let kinds: Vec<CommandKind> = pending.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![CommandKind::CreateTicket, CommandKind::AddLine, CommandKind::AddLine]
        );
        assert_eq!(pending[1].part_id.as_deref(), Some(opened.lines[0].id.as_str()));
        assert_eq!(
            tickets::lines_for(&conn, &opened.ticket.local_id).unwrap(),
            opened.lines
        );
    }

    #[test]
    fn test_invalid_line_writes_nothing() {
        let db = test_state();
        let mut bad = sale();
        bad[1].qty = 0;
        assert!(matches!(
            open_ticket(&db, &ctx(), &bad),
            Err(OutboxError::InvalidInput(_))
        ));

        let conn = db.lock().unwrap();
        assert!(outbox::list_pending(&conn).unwrap().is_empty());
        let tickets: i64 = conn
            .query_row("SELECT COUNT(*) FROM local_tickets", [], |row| row.get(0))
            .unwrap();
        assert_eq!(tickets, 0);
    }

    #[test]
    fn test_pay_cash_requires_known_open_ticket() {
        let db = test_state();
        assert!(matches!(
            pay_cash(&db, &ctx(), "nope"),
            Err(OutboxError::TicketNotFound(_))
        ));

        let opened = open_ticket(&db, &ctx(), &sale()).unwrap();
        let entry = pay_cash(&db, &ctx(), &opened.ticket.local_id).unwrap();
        assert_eq!(entry.kind, CommandKind::PayCash);
        assert!(entry.part_id.is_none());

        {
            let conn = db.lock().unwrap();
            tickets::mark_paid(&conn, &opened.ticket.local_id).unwrap();
        }
        assert!(matches!(
            pay_mock(&db, &ctx(), &opened.ticket.local_id, Value::Null),
            Err(OutboxError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_second_payment_method_is_refused() {
        let db = test_state();
        let opened = open_ticket(&db, &ctx(), &sale()).unwrap();
        let local_id = opened.ticket.local_id.as_str();

        let cash = pay_cash(&db, &ctx(), local_id).unwrap();
        assert!(matches!(
            pay_mock(&db, &ctx(), local_id, serde_json::json!({ "approve": true })),
            Err(OutboxError::InvalidInput(_))
        ));
        // Same method again collapses onto the queued entry.
        assert_eq!(pay_cash(&db, &ctx(), local_id).unwrap().id, cash.id);

        let conn = db.lock().unwrap();
        let payments: Vec<CommandKind> = outbox::list_for_ticket(&conn, local_id)
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .filter(|k| matches!(k, CommandKind::PayCash | CommandKind::PayMock))
            .collect();
        assert_eq!(payments, vec![CommandKind::PayCash]);
    }

    #[test]
    fn test_dead_lettered_payment_still_blocks_other_method() {
        let db = test_state();
        let opened = open_ticket(&db, &ctx(), &sale()).unwrap();
        let local_id = opened.ticket.local_id.as_str();

        let mock = pay_mock(&db, &ctx(), local_id, Value::Null).unwrap();
        {
            let conn = db.lock().unwrap();
            outbox::dead_letter(&conn, &mock.id, "422 declined").unwrap();
        }
        assert!(pay_cash(&db, &ctx(), local_id).is_err());
    }

    #[test]
    fn test_total_overflow_is_rejected() {
        let huge = vec![SaleLine {
            menu_item_id: "gold".into(),
            qty: 2,
            unit_price: i64::MAX,
        }];
        assert!(sale_total(&huge).is_err());
        assert_eq!(sale_total(&[]).unwrap(), 0);
    }
}
