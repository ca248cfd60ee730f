//! Event types, in-process bus and publishing seam

pub mod bus;
pub mod publisher;
pub mod types;

pub use bus::{EventBus, EventBusExt, EventFilter, FilteredReceiver, SharedEventBus};
pub use publisher::{EventPublisher, RetryingPublisher, SharedPublisher};
pub use types::{
    routing, CommentAdded, InboundEvent, OutboundEvent, TicketAssigned, TicketCreated,
    TicketEscalated, TicketPriorityChanged, TicketStatusChanged,
};
