//! Inbound lifecycle events and outbound engine events
//!
//! Inbound payloads are camelCase JSON keyed by routing key. Every field is
//! optional at the serde level so that a missing correlation key surfaces as
//! a MalformedEvent with a precise reason instead of a generic decode error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::state::{AgentId, AssignmentType, Priority, SlaClock, TicketId, TicketNumber, TicketStatus};

/// Routing keys of inbound lifecycle events
pub mod routing {
    pub const TICKET_CREATED: &str = "ticket.created";
    pub const TICKET_ASSIGNED: &str = "ticket.assigned";
    pub const TICKET_STATUS_CHANGED: &str = "ticket.status.changed";
    pub const TICKET_ESCALATED: &str = "ticket.escalated";
    pub const TICKET_PRIORITY_CHANGED: &str = "ticket.priority.changed";
    pub const COMMENT_ADDED: &str = "comment.added";

    pub const SLA_WARNING: &str = "sla.warning";
    pub const SLA_BREACH: &str = "sla.breach";

    /// Every inbound routing key the engine consumes
    pub const INBOUND: &[&str] = &[
        TICKET_CREATED,
        TICKET_ASSIGNED,
        TICKET_STATUS_CHANGED,
        TICKET_ESCALATED,
        TICKET_PRIORITY_CHANGED,
        COMMENT_ADDED,
    ];
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TicketCreated {
    pub ticket_id: String,
    pub ticket_number: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub priority: Option<Priority>,
    pub created_by: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TicketAssigned {
    pub ticket_id: String,
    pub ticket_number: String,
    pub assigned_to_user_id: Option<AgentId>,
    pub assigned_to_username: Option<String>,
    pub assigned_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TicketStatusChanged {
    pub ticket_id: String,
    pub ticket_number: String,
    pub old_status: Option<TicketStatus>,
    pub new_status: Option<TicketStatus>,
    pub changed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TicketEscalated {
    pub ticket_id: String,
    pub ticket_number: String,
    pub escalated_to_user_id: Option<AgentId>,
    pub escalated_to_username: Option<String>,
    pub reason: Option<String>,
    pub escalated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TicketPriorityChanged {
    pub ticket_id: String,
    pub ticket_number: String,
    pub priority: Option<Priority>,
    pub category: Option<String>,
    pub changed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CommentAdded {
    pub ticket_id: String,
    pub ticket_number: String,
    pub comment_id: Option<String>,
    pub author_id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

/// A decoded, validated inbound lifecycle event
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Created(TicketCreated),
    Assigned(TicketAssigned),
    StatusChanged(TicketStatusChanged),
    Escalated(TicketEscalated),
    PriorityChanged(TicketPriorityChanged),
    CommentAdded(CommentAdded),
}

fn parse<'a, T: Deserialize<'a>>(routing_key: &str, payload: &'a [u8]) -> EngineResult<T> {
    serde_json::from_slice(payload).map_err(|e| EngineError::malformed(routing_key, e.to_string()))
}

fn blank(value: &str) -> bool {
    value.trim().is_empty()
}

fn require<T>(routing_key: &str, field: &'static str, value: &Option<T>) -> EngineResult<()> {
    if value.is_none() {
        return Err(EngineError::malformed(routing_key, format!("missing {field}")));
    }
    Ok(())
}

impl InboundEvent {
    /// Decode a raw delivery and validate its required fields
    pub fn decode(routing_key: &str, payload: &[u8]) -> EngineResult<Self> {
        let event = match routing_key {
            routing::TICKET_CREATED => InboundEvent::Created(parse(routing_key, payload)?),
            routing::TICKET_ASSIGNED => InboundEvent::Assigned(parse(routing_key, payload)?),
            routing::TICKET_STATUS_CHANGED => {
                InboundEvent::StatusChanged(parse(routing_key, payload)?)
            }
            routing::TICKET_ESCALATED => InboundEvent::Escalated(parse(routing_key, payload)?),
            routing::TICKET_PRIORITY_CHANGED => {
                InboundEvent::PriorityChanged(parse(routing_key, payload)?)
            }
            routing::COMMENT_ADDED => InboundEvent::CommentAdded(parse(routing_key, payload)?),
            other => {
                return Err(EngineError::malformed(other, "unknown routing key"));
            }
        };
        event.validate()?;
        Ok(event)
    }

    /// Check correlation keys and kind-specific required fields
    pub fn validate(&self) -> EngineResult<()> {
        let key = self.routing_key();
        if blank(self.ticket_id()) {
            return Err(EngineError::malformed(key, "missing ticketId"));
        }
        if blank(self.ticket_number()) {
            return Err(EngineError::malformed(key, "missing ticketNumber"));
        }
        match self {
            InboundEvent::Created(_) => Ok(()),
            InboundEvent::Assigned(e) => require(key, "assignedToUserId", &e.assigned_to_user_id),
            InboundEvent::StatusChanged(e) => require(key, "newStatus", &e.new_status),
            InboundEvent::Escalated(e) => {
                require(key, "escalatedToUserId", &e.escalated_to_user_id)
            }
            InboundEvent::PriorityChanged(e) => require(key, "priority", &e.priority),
            InboundEvent::CommentAdded(e) => require(key, "authorId", &e.author_id),
        }
    }

    /// Routing key this event arrives on
    pub fn routing_key(&self) -> &'static str {
        match self {
            InboundEvent::Created(_) => routing::TICKET_CREATED,
            InboundEvent::Assigned(_) => routing::TICKET_ASSIGNED,
            InboundEvent::StatusChanged(_) => routing::TICKET_STATUS_CHANGED,
            InboundEvent::Escalated(_) => routing::TICKET_ESCALATED,
            InboundEvent::PriorityChanged(_) => routing::TICKET_PRIORITY_CHANGED,
            InboundEvent::CommentAdded(_) => routing::COMMENT_ADDED,
        }
    }

    pub fn ticket_id(&self) -> &str {
        match self {
            InboundEvent::Created(e) => &e.ticket_id,
            InboundEvent::Assigned(e) => &e.ticket_id,
            InboundEvent::StatusChanged(e) => &e.ticket_id,
            InboundEvent::Escalated(e) => &e.ticket_id,
            InboundEvent::PriorityChanged(e) => &e.ticket_id,
            InboundEvent::CommentAdded(e) => &e.ticket_id,
        }
    }

    pub fn ticket_number(&self) -> &str {
        match self {
            InboundEvent::Created(e) => &e.ticket_number,
            InboundEvent::Assigned(e) => &e.ticket_number,
            InboundEvent::StatusChanged(e) => &e.ticket_number,
            InboundEvent::Escalated(e) => &e.ticket_number,
            InboundEvent::PriorityChanged(e) => &e.ticket_number,
            InboundEvent::CommentAdded(e) => &e.ticket_number,
        }
    }

    /// Timestamp carried by the event, if the producer supplied one
    pub fn occurred_at(&self) -> Option<DateTime<Utc>> {
        match self {
            InboundEvent::Created(e) => e.created_at,
            InboundEvent::Assigned(e) => e.assigned_at,
            InboundEvent::StatusChanged(e) => e.changed_at,
            InboundEvent::Escalated(e) => e.escalated_at,
            InboundEvent::PriorityChanged(e) => e.changed_at,
            InboundEvent::CommentAdded(e) => e.created_at,
        }
    }
}

/// Events the engine publishes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum OutboundEvent {
    /// The engine assigned a ticket (AUTO) or applied a manual override
    #[serde(rename = "ticket.assigned")]
    TicketAssigned {
        ticket_id: TicketId,
        ticket_number: TicketNumber,
        agent_id: AgentId,
        assigned_at: DateTime<Utc>,
        assignment_type: AssignmentType,
    },

    /// A pending deadline entered the AT_RISK lead window
    #[serde(rename = "sla.warning")]
    SlaWarning {
        ticket_id: TicketId,
        clock: SlaClock,
        due_at: DateTime<Utc>,
        observed_at: DateTime<Utc>,
    },

    /// A deadline passed before its milestone
    #[serde(rename = "sla.breach")]
    SlaBreach {
        ticket_id: TicketId,
        clock: SlaClock,
        due_at: DateTime<Utc>,
        observed_at: DateTime<Utc>,
    },
}

impl OutboundEvent {
    /// Routing key to publish under
    pub fn routing_key(&self) -> &'static str {
        match self {
            OutboundEvent::TicketAssigned { .. } => routing::TICKET_ASSIGNED,
            OutboundEvent::SlaWarning { .. } => routing::SLA_WARNING,
            OutboundEvent::SlaBreach { .. } => routing::SLA_BREACH,
        }
    }

    pub fn ticket_id(&self) -> &str {
        match self {
            OutboundEvent::TicketAssigned { ticket_id, .. } => ticket_id,
            OutboundEvent::SlaWarning { ticket_id, .. } => ticket_id,
            OutboundEvent::SlaBreach { ticket_id, .. } => ticket_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            OutboundEvent::TicketAssigned { assigned_at, .. } => *assigned_at,
            OutboundEvent::SlaWarning { observed_at, .. } => *observed_at,
            OutboundEvent::SlaBreach { observed_at, .. } => *observed_at,
        }
    }

    /// Serialize for the wire
    pub fn to_payload(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}
