//! Remote command port: the four ticket operations the flusher dispatches.
//!
//! Every operation carries the entry's idempotency key so the remote can
//! collapse retried deliveries into one effect. Implementations classify
//! their failures into [`RemoteError::Transient`] or
//! [`RemoteError::Terminal`]; the flusher retries the former and
//! dead-letters the latter.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RemoteError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketLinePayload {
    pub menu_item_id: String,
    pub qty: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketCreated {
    pub id: String,
}

#[async_trait]
pub trait TicketCommandPort: Send + Sync {
    async fn create_ticket(&self, idempotency_key: &str) -> Result<TicketCreated, RemoteError>;

    async fn add_line(
        &self,
        ticket_id: &str,
        line: &TicketLinePayload,
        idempotency_key: &str,
    ) -> Result<(), RemoteError>;

    async fn pay_cash(&self, ticket_id: &str, idempotency_key: &str) -> Result<(), RemoteError>;

    async fn pay_mock(
        &self,
        ticket_id: &str,
        payload: &Value,
        idempotency_key: &str,
    ) -> Result<(), RemoteError>;
}

/// In-memory remote that deduplicates by idempotency key, records every
/// call, and fails on demand.
#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use crate::idempotency::CommandKind;
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct RemoteCall {
        pub kind: CommandKind,
        pub ticket_id: Option<String>,
        pub key: String,
    }

    #[derive(Debug, Clone)]
    struct Failure {
        error: RemoteError,
        /// Apply the effect server-side, then fail (lost acknowledgement).
        apply_first: bool,
    }

    #[derive(Default)]
    struct State {
        calls: Vec<RemoteCall>,
        tickets_by_key: HashMap<String, String>,
        tickets: HashSet<String>,
        lines: HashMap<String, (String, TicketLinePayload)>,
        payments: HashMap<String, String>,
        scripted: HashMap<CommandKind, VecDeque<Failure>>,
        always: HashMap<CommandKind, RemoteError>,
    }

    #[derive(Default)]
    pub struct MockRemote {
        state: Mutex<State>,
    }

    impl MockRemote {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn fail_next(&self, kind: CommandKind, error: RemoteError) {
            self.push_failure(kind, error, false);
        }

        /// Let the next call of `kind` take effect but report a failure.
        pub fn lose_next_ack(&self, kind: CommandKind) {
            self.push_failure(
                kind,
                RemoteError::Transient("connection reset after commit".into()),
                true,
            );
        }

        pub fn fail_always(&self, kind: CommandKind, error: RemoteError) {
            self.state.lock().unwrap().always.insert(kind, error);
        }

        pub fn heal(&self, kind: CommandKind) {
            self.state.lock().unwrap().always.remove(&kind);
        }

        pub fn calls(&self) -> Vec<RemoteCall> {
            self.state.lock().unwrap().calls.clone()
        }

        pub fn calls_of(&self, kind: CommandKind) -> Vec<RemoteCall> {
            self.calls().into_iter().filter(|c| c.kind == kind).collect()
        }

        pub fn ticket_count(&self) -> usize {
            self.state.lock().unwrap().tickets.len()
        }

        pub fn line_count(&self) -> usize {
            self.state.lock().unwrap().lines.len()
        }

        pub fn payment_count(&self) -> usize {
            self.state.lock().unwrap().payments.len()
        }

        fn push_failure(&self, kind: CommandKind, error: RemoteError, apply_first: bool) {
            self.state
                .lock()
                .unwrap()
                .scripted
                .entry(kind)
                .or_default()
                .push_back(Failure { error, apply_first });
        }

        /// Record the call and run `apply` unless a failure is due.
        fn handle<T>(
            &self,
            kind: CommandKind,
            ticket_id: Option<&str>,
            key: &str,
            apply: impl FnOnce(&mut State) -> Result<T, RemoteError>,
        ) -> Result<T, RemoteError> {
            let mut state = self.state.lock().unwrap();
            state.calls.push(RemoteCall {
                kind,
                ticket_id: ticket_id.map(str::to_string),
                key: key.to_string(),
            });
            if let Some(error) = state.always.get(&kind).cloned() {
                return Err(error);
            }
            let failure = state.scripted.get_mut(&kind).and_then(VecDeque::pop_front);
            match failure {
                Some(Failure {
                    error,
                    apply_first: true,
                }) => {
                    apply(&mut state)?;
                    Err(error)
                }
                Some(Failure { error, .. }) => Err(error),
                None => apply(&mut state),
            }
        }
    }

    fn require_ticket(state: &State, ticket_id: &str) -> Result<(), RemoteError> {
        if state.tickets.contains(ticket_id) {
            Ok(())
        } else {
            Err(RemoteError::Terminal(format!("404 ticket {ticket_id} not found")))
        }
    }

    #[async_trait]
    impl TicketCommandPort for MockRemote {
        async fn create_ticket(&self, idempotency_key: &str) -> Result<TicketCreated, RemoteError> {
            self.handle(CommandKind::CreateTicket, None, idempotency_key, |state| {
                if let Some(id) = state.tickets_by_key.get(idempotency_key) {
                    return Ok(TicketCreated { id: id.clone() });
                }
                let id = format!("srv-{}", state.tickets.len() + 1);
                state
                    .tickets_by_key
                    .insert(idempotency_key.to_string(), id.clone());
                state.tickets.insert(id.clone());
                Ok(TicketCreated { id })
            })
        }

        async fn add_line(
            &self,
            ticket_id: &str,
            line: &TicketLinePayload,
            idempotency_key: &str,
        ) -> Result<(), RemoteError> {
            self.handle(CommandKind::AddLine, Some(ticket_id), idempotency_key, |state| {
                require_ticket(state, ticket_id)?;
                state
                    .lines
                    .entry(idempotency_key.to_string())
                    .or_insert_with(|| (ticket_id.to_string(), line.clone()));
                Ok(())
            })
        }

        async fn pay_cash(&self, ticket_id: &str, idempotency_key: &str) -> Result<(), RemoteError> {
            self.handle(CommandKind::PayCash, Some(ticket_id), idempotency_key, |state| {
                require_ticket(state, ticket_id)?;
                state
                    .payments
                    .entry(idempotency_key.to_string())
                    .or_insert_with(|| ticket_id.to_string());
                Ok(())
            })
        }

        async fn pay_mock(
            &self,
            ticket_id: &str,
            _payload: &Value,
            idempotency_key: &str,
        ) -> Result<(), RemoteError> {
            self.handle(CommandKind::PayMock, Some(ticket_id), idempotency_key, |state| {
                require_ticket(state, ticket_id)?;
                state
                    .payments
                    .entry(idempotency_key.to_string())
                    .or_insert_with(|| ticket_id.to_string());
                Ok(())
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockRemote;
    use super::*;
    use crate::idempotency::CommandKind;

    #[tokio::test]
    async fn test_mock_deduplicates_create_by_key() {
        let remote = MockRemote::new();
        let a = remote.create_ticket("k-1").await.unwrap();
        let b = remote.create_ticket("k-1").await.unwrap();
        let c = remote.create_ticket("k-2").await.unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(remote.ticket_count(), 2);
        assert_eq!(remote.calls_of(CommandKind::CreateTicket).len(), 3);
    }

    #[tokio::test]
    async fn test_mock_lost_ack_applies_effect() {
        let remote = MockRemote::new();
        remote.lose_next_ack(CommandKind::CreateTicket);

        assert!(remote.create_ticket("k-1").await.is_err());
        assert_eq!(remote.ticket_count(), 1);

        let retry = remote.create_ticket("k-1").await.unwrap();
        assert_eq!(retry.id, "srv-1");
        assert_eq!(remote.ticket_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_rejects_line_for_unknown_ticket() {
        let remote = MockRemote::new();
        let line = TicketLinePayload {
            menu_item_id: "cookie".into(),
            qty: 1,
        };
        let err = remote.add_line("srv-9", &line, "k-1").await.unwrap_err();
        assert!(err.is_terminal());
    }
}
