//! Local state for the assignment and SLA engine
//!
//! The engine owns an eventually-consistent read-model, never the system of
//! record:
//! - `tickets`: TicketView projections built from lifecycle events
//! - `ticket_numbers`: index from external ticket number to ticket ID
//! - `assignments`: assignment history, at most one ACTIVE per ticket
//! - `trackings`: one SlaTracking per ticket once its priority is known
//!
//! # Usage
//!
//! ```ignore
//! use ticket_engine::state::{StateStore, TicketLocks};
//!
//! let store = StateStore::new().shared();
//! let locks = TicketLocks::new();
//!
//! let _guard = locks.lock("TCK-1042").await;
//! let view = store.get_ticket("7f1c...")?;
//! ```

pub mod locks;
pub mod schema;
pub mod store;
pub mod types;

// Re-export core types
pub use locks::{TicketGuard, TicketLocks};
pub use store::{SharedStateStore, StateStore, StoreError, StoreResult};
pub use types::{
    AgentId, AgentStatus, AgentWorkload, Assignment, AssignmentStatus, AssignmentType, Priority,
    SlaClock, SlaStatus, SlaTracking, TicketId, TicketNumber, TicketStatus, TicketView, UNTITLED,
};
