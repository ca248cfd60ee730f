//! Core types for the engine's local read-model
//!
//! These records are owned by the engine's keyed store. None of them is a
//! system of record: tickets and agents are mirrored from upstream events and
//! the agent directory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Internal ticket identifier, immutable once first observed
pub type TicketId = String;

/// Human-facing ticket number, the stable external correlation key
pub type TicketNumber = String;

/// Agent identifier as issued by the agent directory
pub type AgentId = String;

/// Placeholder title for tickets created without one
pub const UNTITLED: &str = "(untitled)";

/// Lifecycle status of a ticket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketStatus {
    Open,
    Assigned,
    InProgress,
    Resolved,
    Closed,
    Reopened,
    Escalated,
}

impl TicketStatus {
    /// Whether the ticket reached a terminal status (RESOLVED or CLOSED)
    pub fn is_terminal(&self) -> bool {
        matches!(self, TicketStatus::Resolved | TicketStatus::Closed)
    }
}

impl std::fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TicketStatus::Open => write!(f, "OPEN"),
            TicketStatus::Assigned => write!(f, "ASSIGNED"),
            TicketStatus::InProgress => write!(f, "IN_PROGRESS"),
            TicketStatus::Resolved => write!(f, "RESOLVED"),
            TicketStatus::Closed => write!(f, "CLOSED"),
            TicketStatus::Reopened => write!(f, "REOPENED"),
            TicketStatus::Escalated => write!(f, "ESCALATED"),
        }
    }
}

/// Ticket priority, the primary SLA rule key
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    /// All priorities, lowest first
    pub fn all() -> &'static [Priority] {
        &[
            Priority::Low,
            Priority::Medium,
            Priority::High,
            Priority::Critical,
        ]
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "LOW"),
            Priority::Medium => write!(f, "MEDIUM"),
            Priority::High => write!(f, "HIGH"),
            Priority::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Local projection of a ticket, built from lifecycle events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketView {
    /// Internal identifier (immutable)
    pub ticket_id: TicketId,

    /// External correlation key
    pub ticket_number: TicketNumber,

    pub title: String,

    pub description: Option<String>,

    pub status: TicketStatus,

    /// Unknown until the creator or a manager supplies it
    pub priority: Option<Priority>,

    pub category: Option<String>,

    pub created_by: Option<String>,

    /// Agent currently handling the ticket, if any
    pub assigned_agent: Option<AgentId>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    /// Upstream time of the last applied status change; older status events
    /// are stale
    #[serde(default)]
    pub status_changed_at: Option<DateTime<Utc>>,
}

impl TicketView {
    /// Whether the ticket can enter the assignment path
    pub fn is_assignable(&self) -> bool {
        self.priority.is_some() && !self.status.is_terminal()
    }
}

/// Presence state of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Available,
    Busy,
    Offline,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Available => write!(f, "AVAILABLE"),
            AgentStatus::Busy => write!(f, "BUSY"),
            AgentStatus::Offline => write!(f, "OFFLINE"),
        }
    }
}

/// Per-agent load counter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentWorkload {
    pub agent_id: AgentId,
    pub username: Option<String>,
    pub status: AgentStatus,
    /// Number of ACTIVE assignments referencing this agent
    pub active_ticket_count: u32,
}

impl AgentWorkload {
    pub fn new(agent_id: impl Into<AgentId>, status: AgentStatus) -> Self {
        Self {
            agent_id: agent_id.into(),
            username: None,
            status,
            active_ticket_count: 0,
        }
    }
}

/// Lifecycle of an assignment record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssignmentStatus {
    Active,
    /// Replaced by a reassignment or escalation
    Superseded,
    /// Ticket reached a terminal status while this assignment was active
    Completed,
}

/// How an assignment came about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssignmentType {
    Manual,
    Auto,
    Escalation,
}

impl std::fmt::Display for AssignmentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssignmentType::Manual => write!(f, "MANUAL"),
            AssignmentType::Auto => write!(f, "AUTO"),
            AssignmentType::Escalation => write!(f, "ESCALATION"),
        }
    }
}

/// A ticket-to-agent assignment. History is kept, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub ticket_id: TicketId,
    pub agent_id: AgentId,
    pub assigned_at: DateTime<Utc>,
    pub assignment_type: AssignmentType,
    pub status: AssignmentStatus,
}

impl Assignment {
    /// Create a new ACTIVE assignment
    pub fn active(
        ticket_id: impl Into<TicketId>,
        agent_id: impl Into<AgentId>,
        assignment_type: AssignmentType,
        assigned_at: DateTime<Utc>,
    ) -> Self {
        Self {
            ticket_id: ticket_id.into(),
            agent_id: agent_id.into(),
            assigned_at,
            assignment_type,
            status: AssignmentStatus::Active,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == AssignmentStatus::Active
    }
}

/// SLA state of a ticket.
///
/// Ordered so that `max` moves a status forward and never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlaStatus {
    OnTrack,
    AtRisk,
    Breached,
    Resolved,
}

impl SlaStatus {
    /// Move toward `target`, never regressing
    pub fn advance(self, target: SlaStatus) -> SlaStatus {
        self.max(target)
    }
}

impl std::fmt::Display for SlaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlaStatus::OnTrack => write!(f, "ON_TRACK"),
            SlaStatus::AtRisk => write!(f, "AT_RISK"),
            SlaStatus::Breached => write!(f, "BREACHED"),
            SlaStatus::Resolved => write!(f, "RESOLVED"),
        }
    }
}

/// Which SLA deadline a signal refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlaClock {
    Response,
    Resolution,
}

impl std::fmt::Display for SlaClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlaClock::Response => write!(f, "RESPONSE"),
            SlaClock::Resolution => write!(f, "RESOLUTION"),
        }
    }
}

/// Per-ticket SLA deadlines and breach state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaTracking {
    pub ticket_id: TicketId,

    /// Priority the deadlines were computed from
    pub priority: Priority,

    pub category: Option<String>,

    /// When the clock started (priority became known)
    pub started_at: DateTime<Utc>,

    pub response_due_at: DateTime<Utc>,

    pub resolution_due_at: DateTime<Utc>,

    pub first_response_at: Option<DateTime<Utc>>,

    /// Set exactly once; freezes further evaluation
    pub resolved_at: Option<DateTime<Utc>>,

    /// Publish guard for the response breach event
    pub response_breached: bool,

    /// Publish guard for the resolution breach event
    pub resolution_breached: bool,

    pub sla_status: SlaStatus,

    /// Bumped by the store whenever the record changes
    pub version: u64,
}

impl SlaTracking {
    /// Whether the sweep still has to look at this tracking
    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }

    /// Whether the response clock is still running
    pub fn awaiting_response(&self) -> bool {
        self.first_response_at.is_none() && !self.response_breached
    }
}
