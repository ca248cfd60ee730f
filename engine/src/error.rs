//! Error types at the engine boundary
//!
//! Classification decides what the transport does with a delivery: dropped
//! (acknowledged and logged) or redelivered.

use std::time::Duration;

use crate::state::{AgentId, StoreError, TicketId};

/// Error type for engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Missing correlation key, missing required field, unknown routing key
    /// or undecodable payload. Never retried.
    #[error("Malformed {routing_key} event: {reason}")]
    MalformedEvent { routing_key: String, reason: String },

    /// Event refers to a ticket the local view has not seen yet. Never
    /// retried; reconciliation is out of band.
    #[error("{routing_key} event references unknown ticket {ticket_ref}")]
    UnknownTicketReference {
        routing_key: String,
        ticket_ref: String,
    },

    #[error("State store error: {0}")]
    Store(#[from] StoreError),

    #[error("Workload error: {0}")]
    Workload(#[from] WorkloadError),

    /// Workload transfer could not be confirmed after all retries
    #[error("Workload transfer for ticket {ticket_id} unconfirmed after {attempts} attempts")]
    TransferUnconfirmed { ticket_id: TicketId, attempts: u32 },
}

impl EngineError {
    pub fn malformed(routing_key: &str, reason: impl Into<String>) -> Self {
        EngineError::MalformedEvent {
            routing_key: routing_key.to_string(),
            reason: reason.into(),
        }
    }

    pub fn unknown_ticket(routing_key: &str, ticket_ref: &str) -> Self {
        EngineError::UnknownTicketReference {
            routing_key: routing_key.to_string(),
            ticket_ref: ticket_ref.to_string(),
        }
    }

    /// Whether redelivering the same event can succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::MalformedEvent { .. } | EngineError::UnknownTicketReference { .. } => false,
            EngineError::Store(_)
            | EngineError::Workload(_)
            | EngineError::TransferUnconfirmed { .. } => true,
        }
    }
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Error type for workload counter operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkloadError {
    #[error("Workload lock poisoned for agent {0}")]
    LockPoisoned(AgentId),

    #[error("Roster lock poisoned")]
    RosterPoisoned,
}

/// Error type for agent directory lookups
#[derive(Debug, Clone, thiserror::Error)]
pub enum DirectoryError {
    #[error("Agent directory timed out after {0:?}")]
    Timeout(Duration),

    #[error("Agent directory unavailable: {0}")]
    Unavailable(String),
}

/// Error type for outbound publishing
#[derive(Debug, Clone, thiserror::Error)]
pub enum PublishError {
    #[error("Failed to send event: {0}")]
    SendFailed(String),

    #[error("Channel closed")]
    ChannelClosed,

    /// Retries exhausted; the event waits in the outbox
    #[error("{routing_key} event parked in outbox after {attempts} attempts")]
    Parked { routing_key: String, attempts: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drop_versus_redeliver_classification() {
        assert!(!EngineError::malformed("ticket.created", "missing ticketId").is_retryable());
        assert!(!EngineError::unknown_ticket("ticket.assigned", "t-404").is_retryable());
        assert!(EngineError::Store(StoreError::LockPoisoned("tickets")).is_retryable());
        assert!(EngineError::TransferUnconfirmed {
            ticket_id: "t-1".to_string(),
            attempts: 3
        }
        .is_retryable());
    }

    #[test]
    fn test_error_messages_name_the_event() {
        let err = EngineError::malformed("ticket.escalated", "missing escalatedToUserId");
        assert_eq!(
            err.to_string(),
            "Malformed ticket.escalated event: missing escalatedToUserId"
        );
    }
}
