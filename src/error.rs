//! Error types shared by the local stores and the remote port.

use thiserror::Error;

/// Errors raised by the local stores and the enqueue paths.
///
/// Anything returned from an enqueue path is a precondition failure and is
/// surfaced to the caller directly. Once a command is queued, failures are
/// recorded on the entry instead.
#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("device context is missing: {0}")]
    MissingDeviceContext(&'static str),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("local ticket not found: {0}")]
    TicketNotFound(String),

    #[error("outbox entry not found: {0}")]
    EntryNotFound(String),

    #[error(
        "mapping conflict for ticket {local_ticket_id}: already mapped to {existing}, refusing {attempted}"
    )]
    MappingConflict {
        local_ticket_id: String,
        existing: String,
        attempted: String,
    },

    #[error("invalid stored value in {field}: {value}")]
    InvalidStoredValue { field: &'static str, value: String },

    #[error("invalid configuration {name}={value:?}")]
    InvalidConfig { name: &'static str, value: String },

    #[error("database lock poisoned")]
    LockPoisoned,

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = OutboxError> = std::result::Result<T, E>;

/// Failure reported by the remote command port, already classified.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// Worth retrying on the next tick (network, timeouts, 429, 5xx, auth).
    #[error("{0}")]
    Transient(String),

    /// The remote rejected the command for good; retrying cannot succeed.
    #[error("{0}")]
    Terminal(String),
}

impl RemoteError {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RemoteError::Terminal(_))
    }

    pub fn message(&self) -> &str {
        match self {
            RemoteError::Transient(m) | RemoteError::Terminal(m) => m,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_classification_accessors() {
        let transient = RemoteError::Transient("503 unavailable".into());
        let terminal = RemoteError::Terminal("422 invalid qty".into());

        assert!(!transient.is_terminal());
        assert!(terminal.is_terminal());
        assert_eq!(terminal.message(), "422 invalid qty");
        assert_eq!(transient.to_string(), "503 unavailable");
    }

    #[test]
    fn test_mapping_conflict_message_names_both_ids() {
        let err = OutboxError::MappingConflict {
            local_ticket_id: "t-1".into(),
            existing: "srv-1".into(),
            attempted: "srv-2".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("srv-1"));
        assert!(msg.contains("srv-2"));
    }
}
