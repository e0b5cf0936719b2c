//! Outbox flusher: the single worker that drains the outbox.
//!
//! Each pass snapshots the pending entries and dispatches them one at a
//! time, in queue order, against the remote command port. Commands that
//! address an existing server ticket wait until ticket creation has been
//! acknowledged and its mapping written; until then they are left untouched
//! (`PendingDependency`), without a try or an error being recorded. The
//! same holds for every command queued behind a dead letter of its ticket,
//! until that dead letter is requeued or purged.
//!
//! Local side effects of a successful dispatch (mapping write, ticket marked
//! paid) commit in the same transaction as the entry's removal. If that
//! commit fails the entry stays queued and is re-sent with the same key,
//! which the remote collapses into the effect it already applied.
//!
//! Passes are separated by a fixed delay measured from the end of the
//! previous pass. Stopping cancels the delay at once but lets an in-flight
//! dispatch finish recording its outcome.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db::DbState;
use crate::error::{OutboxError, RemoteError, Result};
use crate::mapping;
use crate::outbox::{self, Command, OutboxEntry};
use crate::remote::{TicketCommandPort, TicketLinePayload};
use crate::tickets;

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Idle,
    Running,
    Stopped,
}

/// What happened to one entry during a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// Remote confirmed; local effects applied and the entry removed.
    Acknowledged,
    /// Not sent: no server ticket yet, or an earlier command for the same
    /// ticket is still queued or dead-lettered. Entry left untouched.
    PendingDependency,
    /// Transient remote failure recorded on the entry.
    Retrying { error: String },
    /// Terminal remote failure; entry parked.
    DeadLettered { error: String },
    /// Local storage failed while handling the entry; it stays queued as is.
    StorageError { error: String },
}

impl DispatchOutcome {
    /// Whether later commands of the same ticket must wait. Anything short
    /// of an acknowledgement holds the ticket, dead letters included.
    fn holds_ticket(&self) -> bool {
        !matches!(self, DispatchOutcome::Acknowledged)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushReport {
    pub acknowledged: usize,
    pub pending_dependency: usize,
    pub retrying: usize,
    pub dead_lettered: usize,
    pub storage_errors: usize,
    /// `(entry id, outcome)` in dispatch order.
    pub outcomes: Vec<(String, DispatchOutcome)>,
    /// The pass stopped early because the worker was cancelled.
    pub cancelled: bool,
}

impl FlushReport {
    fn record(&mut self, entry_id: &str, outcome: DispatchOutcome) {
        match &outcome {
            DispatchOutcome::Acknowledged => self.acknowledged += 1,
            DispatchOutcome::PendingDependency => self.pending_dependency += 1,
            DispatchOutcome::Retrying { .. } => self.retrying += 1,
            DispatchOutcome::DeadLettered { .. } => self.dead_lettered += 1,
            DispatchOutcome::StorageError { .. } => self.storage_errors += 1,
        }
        self.outcomes.push((entry_id.to_string(), outcome));
    }

    pub fn outcome_of(&self, entry_id: &str) -> Option<&DispatchOutcome> {
        self.outcomes
            .iter()
            .find(|(id, _)| id == entry_id)
            .map(|(_, outcome)| outcome)
    }
}

/// Local effect committed together with the acknowledgement.
enum Completion {
    Mapped(String),
    LineAdded,
    Paid,
}

struct Worker {
    state: WorkerState,
    cancel: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

pub struct Flusher {
    db: Arc<DbState>,
    remote: Arc<dyn TicketCommandPort>,
    interval: Duration,
    worker: Mutex<Worker>,
    /// Keeps the loop and `flush_now` from running passes side by side.
    pass_lock: tokio::sync::Mutex<()>,
    last_flush: Mutex<Option<DateTime<Utc>>>,
}

impl Flusher {
    pub fn new(db: Arc<DbState>, remote: Arc<dyn TicketCommandPort>, interval: Duration) -> Self {
        Self {
            db,
            remote,
            interval,
            worker: Mutex::new(Worker {
                state: WorkerState::Idle,
                cancel: None,
                handle: None,
            }),
            pass_lock: tokio::sync::Mutex::new(()),
            last_flush: Mutex::new(None),
        }
    }

    pub fn state(&self) -> WorkerState {
        self.worker().state
    }

    /// When the last pass finished.
    pub fn last_flush_at(&self) -> Option<DateTime<Utc>> {
        *self.last_flush.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Spawn the background loop. Returns `false` if it is already running.
    /// Must be called from within a tokio runtime.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut worker = self.worker();
        if worker.state == WorkerState::Running {
            return false;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(self).run_loop(cancel.clone()));
        worker.state = WorkerState::Running;
        worker.cancel = Some(cancel);
        worker.handle = Some(handle);
        true
    }

    /// Stop the loop and wait for it to exit. An in-flight dispatch completes
    /// and records its outcome first. No-op unless running.
    pub async fn stop(&self) {
        let (cancel, handle) = {
            let mut worker = self.worker();
            if worker.state != WorkerState::Running {
                return;
            }
            worker.state = WorkerState::Stopped;
            (worker.cancel.take(), worker.handle.take())
        };

        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Outbox flusher task ended abnormally: {e}");
            }
        }
    }

    /// Run one pass right away, outside the timer.
    pub async fn flush_now(&self) -> FlushReport {
        self.run_pass(&CancellationToken::new()).await
    }

    fn worker(&self) -> MutexGuard<'_, Worker> {
        self.worker.lock().unwrap_or_else(|p| p.into_inner())
    }

    async fn run_loop(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "Outbox flusher started"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let report = self.run_pass(&cancel).await;
            if report.acknowledged > 0 || report.retrying > 0 || report.dead_lettered > 0 {
                info!(
                    acknowledged = report.acknowledged,
                    waiting = report.pending_dependency,
                    retrying = report.retrying,
                    dead_lettered = report.dead_lettered,
                    "Flush pass complete"
                );
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        info!("Outbox flusher stopped");
    }

    /// One pass over a snapshot of the pending entries.
    pub async fn run_pass(&self, cancel: &CancellationToken) -> FlushReport {
        let _pass = self.pass_lock.lock().await;
        let mut report = FlushReport::default();

        let (entries, mut held_tickets) = match self.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Outbox snapshot failed: {e}");
                return report;
            }
        };
        if !entries.is_empty() {
            debug!(pending = entries.len(), "Flush pass starting");
        }

        // Tickets with a dead letter, or with an earlier command that did not
        // go through in this pass. Their later commands wait so each ticket's
        // commands reach the remote in order and none is skipped.
        for entry in &entries {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let outcome = if held_tickets.contains(&entry.local_ticket_id) {
                DispatchOutcome::PendingDependency
            } else {
                self.dispatch(entry).await
            };

            if outcome.holds_ticket() {
                held_tickets.insert(entry.local_ticket_id.clone());
            }
            report.record(&entry.id, outcome);
        }

        *self.last_flush.lock().unwrap_or_else(|p| p.into_inner()) = Some(Utc::now());
        report
    }

    /// Pending entries in queue order, plus the tickets parked behind a
    /// dead letter until it is requeued or purged.
    fn snapshot(&self) -> Result<(Vec<OutboxEntry>, HashSet<String>)> {
        let conn = self.db.lock()?;
        let parked = outbox::list_dead_letters(&conn)?
            .into_iter()
            .map(|e| e.local_ticket_id)
            .collect();
        Ok((outbox::list_pending(&conn)?, parked))
    }

    async fn dispatch(&self, entry: &OutboxEntry) -> DispatchOutcome {
        let key = entry.idempotency_key.as_str();

        let server_ticket_id = if entry.kind.requires_mapping() {
            match self.server_ticket_id(&entry.local_ticket_id) {
                Ok(Some(id)) => Some(id),
                Ok(None) => {
                    debug!(
                        entry_id = %entry.id,
                        kind = %entry.kind,
                        local_ticket_id = %entry.local_ticket_id,
                        "Waiting for ticket mapping"
                    );
                    return DispatchOutcome::PendingDependency;
                }
                Err(e) => return storage_error(entry, &e),
            }
        } else {
            None
        };

        let result = match (&entry.command, server_ticket_id.as_deref()) {
            (Command::CreateTicket, _) => self
                .remote
                .create_ticket(key)
                .await
                .map(|created| Completion::Mapped(created.id)),
            (Command::AddLine { menu_item_id, qty }, Some(ticket_id)) => {
                let line = TicketLinePayload {
                    menu_item_id: menu_item_id.clone(),
                    qty: *qty,
                };
                self.remote
                    .add_line(ticket_id, &line, key)
                    .await
                    .map(|()| Completion::LineAdded)
            }
            (Command::PayCash, Some(ticket_id)) => self
                .remote
                .pay_cash(ticket_id, key)
                .await
                .map(|()| Completion::Paid),
            (Command::PayMock { payload }, Some(ticket_id)) => self
                .remote
                .pay_mock(ticket_id, payload, key)
                .await
                .map(|()| Completion::Paid),
            (_, None) => return DispatchOutcome::PendingDependency,
        };

        match result {
            Ok(completion) => self.complete(entry, completion),
            Err(e) => self.fail(entry, e),
        }
    }

    fn server_ticket_id(&self, local_ticket_id: &str) -> Result<Option<String>> {
        let conn = self.db.lock()?;
        mapping::get(&conn, local_ticket_id)
    }

    /// Apply the local effect and drop the entry, atomically.
    fn complete(&self, entry: &OutboxEntry, completion: Completion) -> DispatchOutcome {
        match self.commit_completion(entry, &completion) {
            Ok(()) => {
                debug!(entry_id = %entry.id, kind = %entry.kind, "Outbox entry acknowledged");
                DispatchOutcome::Acknowledged
            }
            Err(err @ OutboxError::MappingConflict { .. }) => {
                // The remote returned a different ticket for the same key.
                if cfg!(debug_assertions) {
                    panic!("ticket mapping invariant violated: {err}");
                }
                error!(entry_id = %entry.id, "{err}");
                self.fail(entry, RemoteError::Terminal(err.to_string()))
            }
            Err(e) => storage_error(entry, &e),
        }
    }

    fn commit_completion(&self, entry: &OutboxEntry, completion: &Completion) -> Result<()> {
        let mut conn = self.db.lock()?;
        let tx = conn.transaction()?;
        match completion {
            Completion::Mapped(server_ticket_id) => {
                mapping::set(&tx, &entry.local_ticket_id, server_ticket_id)?;
            }
            Completion::LineAdded => {}
            Completion::Paid => match tickets::mark_paid(&tx, &entry.local_ticket_id) {
                Err(OutboxError::TicketNotFound(_)) => {
                    warn!(
                        local_ticket_id = %entry.local_ticket_id,
                        "Payment acknowledged for a ticket missing locally"
                    );
                }
                other => other?,
            },
        }
        outbox::acknowledge(&tx, &entry.id)?;
        tx.commit()?;
        Ok(())
    }

    fn fail(&self, entry: &OutboxEntry, err: RemoteError) -> DispatchOutcome {
        let message = err.message().to_string();
        let recorded = {
            let conn = match self.db.lock() {
                Ok(conn) => conn,
                Err(e) => return storage_error(entry, &e),
            };
            if err.is_terminal() {
                outbox::dead_letter(&conn, &entry.id, &message)
            } else {
                outbox::record_failure(&conn, &entry.id, &message)
            }
        };

        if let Err(e) = recorded {
            return storage_error(entry, &e);
        }

        if err.is_terminal() {
            DispatchOutcome::DeadLettered { error: message }
        } else {
            warn!(
                entry_id = %entry.id,
                kind = %entry.kind,
                try_count = entry.try_count + 1,
                error = %message,
                "Outbox dispatch failed, will retry"
            );
            DispatchOutcome::Retrying { error: message }
        }
    }
}

fn storage_error(entry: &OutboxEntry, err: &OutboxError) -> DispatchOutcome {
    error!(entry_id = %entry.id, kind = %entry.kind, "Outbox storage error: {err}");
    DispatchOutcome::StorageError {
        error: err.to_string(),
    }
}
