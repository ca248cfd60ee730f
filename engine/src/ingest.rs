//! Event ingestion and idempotency guard
//!
//! The guard is the only writer of [`TicketView`]. Every merge assigns
//! fields and never increments anything, so applying the same event twice
//! leaves the same view behind.
//!
//! | Event                     | Unknown ticket          | Known ticket                 |
//! |---------------------------|-------------------------|------------------------------|
//! | `ticket.created`          | create view             | Duplicate, nothing touched   |
//! | `ticket.assigned`         | UnknownTicketReference  | set agent, maybe ASSIGNED    |
//! | `ticket.status.changed`   | UnknownTicketReference  | set status unless stale      |
//! | `ticket.escalated`        | UnknownTicketReference  | set agent, ESCALATED         |
//! | `ticket.priority.changed` | UnknownTicketReference  | set priority (and category)  |
//!
//! A status event is stale when its `changedAt` is older than the last
//! applied stamped status change, or when it would move a RESOLVED/CLOSED ticket anywhere but
//! REOPENED or another terminal status. Stale events leave the view alone
//! and trigger no follow-up work.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::events::{
    routing, InboundEvent, TicketAssigned, TicketCreated, TicketEscalated,
    TicketPriorityChanged, TicketStatusChanged,
};
use crate::state::{SharedStateStore, StoreError, TicketId, TicketStatus, TicketView, UNTITLED};

/// Result of applying one event to the local view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// A new view was created
    Created,
    /// Creation event for a ticket already known; nothing changed
    Duplicate,
    /// The view changed
    Updated,
    /// The event carried nothing new
    Unchanged,
    /// The event was overtaken by a later one and was ignored
    Stale,
}

impl IngestOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, IngestOutcome::Created | IngestOutcome::Updated)
    }
}

/// Applies lifecycle events to the local ticket view
pub struct IngestionGuard {
    store: SharedStateStore,
}

impl IngestionGuard {
    pub fn new(store: SharedStateStore) -> Self {
        Self { store }
    }

    /// Current view of a ticket
    pub fn view(&self, ticket_id: &str) -> EngineResult<Option<TicketView>> {
        Ok(self.store.get_ticket(ticket_id)?)
    }

    /// Resolve an event's correlation keys to a known ticket ID.
    ///
    /// Looks up the ID first and falls back to the ticket-number index.
    pub fn resolve(&self, event: &InboundEvent) -> EngineResult<TicketId> {
        self.resolve_keys(event.routing_key(), event.ticket_id(), event.ticket_number())
    }

    fn resolve_keys(
        &self,
        routing_key: &str,
        ticket_id: &str,
        ticket_number: &str,
    ) -> EngineResult<TicketId> {
        if self.store.get_ticket(ticket_id)?.is_some() {
            return Ok(ticket_id.to_string());
        }
        if let Some(bound) = self.store.ticket_id_for_number(ticket_number)? {
            debug!(ticket_id, ticket_number, bound_id = %bound, "Resolved ticket by number");
            return Ok(bound);
        }
        Err(EngineError::unknown_ticket(routing_key, ticket_number))
    }

    /// `ticket.created`: create the view unless the ticket is already known
    pub fn apply_created(
        &self,
        event: &TicketCreated,
        now: DateTime<Utc>,
    ) -> EngineResult<IngestOutcome> {
        if self.store.get_ticket(&event.ticket_id)?.is_some() {
            return Ok(IngestOutcome::Duplicate);
        }
        if let Some(bound) = self.store.ticket_id_for_number(&event.ticket_number)? {
            warn!(
                ticket_id = %event.ticket_id,
                ticket_number = %event.ticket_number,
                bound_id = %bound,
                "Ticket number already bound to another ID, keeping the first"
            );
            return Ok(IngestOutcome::Duplicate);
        }

        let created_at = event.created_at.unwrap_or(now);
        let title = event
            .title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(UNTITLED)
            .to_string();

        let view = TicketView {
            ticket_id: event.ticket_id.clone(),
            ticket_number: event.ticket_number.clone(),
            title,
            description: event.description.clone(),
            status: TicketStatus::Open,
            priority: event.priority,
            category: event.category.clone(),
            created_by: event.created_by.clone(),
            assigned_agent: None,
            created_at,
            updated_at: created_at,
            status_changed_at: None,
        };

        match self.store.insert_ticket_if_absent(view) {
            Ok(true) => Ok(IngestOutcome::Created),
            Ok(false) | Err(StoreError::TicketNumberTaken { .. }) => Ok(IngestOutcome::Duplicate),
            Err(e) => Err(e.into()),
        }
    }

    /// `ticket.assigned` from upstream
    pub fn apply_assigned(
        &self,
        event: &TicketAssigned,
        now: DateTime<Utc>,
    ) -> EngineResult<(TicketId, IngestOutcome)> {
        let key = routing::TICKET_ASSIGNED;
        let ticket_id = self.resolve_keys(key, &event.ticket_id, &event.ticket_number)?;
        let agent_id = event
            .assigned_to_user_id
            .as_deref()
            .ok_or_else(|| EngineError::malformed(key, "missing assignedToUserId"))?;
        let at = event.assigned_at.unwrap_or(now);
        let outcome = self.set_assigned_agent(&ticket_id, agent_id, at)?;
        Ok((ticket_id, outcome))
    }

    /// Record which agent handles a ticket.
    ///
    /// Status moves to ASSIGNED only from OPEN or REOPENED; an in-flight or
    /// terminal status is left alone.
    pub fn set_assigned_agent(
        &self,
        ticket_id: &str,
        agent_id: &str,
        at: DateTime<Utc>,
    ) -> EngineResult<IngestOutcome> {
        let outcome = self.store.update_ticket(ticket_id, |view| {
            let next_status = match view.status {
                TicketStatus::Open | TicketStatus::Reopened => TicketStatus::Assigned,
                other => other,
            };
            if view.assigned_agent.as_deref() == Some(agent_id) && view.status == next_status {
                return IngestOutcome::Unchanged;
            }
            view.assigned_agent = Some(agent_id.to_string());
            view.status = next_status;
            view.updated_at = view.updated_at.max(at);
            IngestOutcome::Updated
        })?;
        outcome.ok_or_else(|| EngineError::unknown_ticket(routing::TICKET_ASSIGNED, ticket_id))
    }

    /// `ticket.status.changed`
    pub fn apply_status_changed(
        &self,
        event: &TicketStatusChanged,
        now: DateTime<Utc>,
    ) -> EngineResult<(TicketId, IngestOutcome)> {
        let key = routing::TICKET_STATUS_CHANGED;
        let ticket_id = self.resolve_keys(key, &event.ticket_id, &event.ticket_number)?;
        let new_status = event
            .new_status
            .ok_or_else(|| EngineError::malformed(key, "missing newStatus"))?;
        let stamped = event.changed_at;
        let at = stamped.unwrap_or(now);

        let outcome = self.store.update_ticket(&ticket_id, |view| {
            if let (Some(changed_at), Some(last)) = (stamped, view.status_changed_at) {
                if changed_at < last {
                    return IngestOutcome::Stale;
                }
            }
            if view.status.is_terminal()
                && !new_status.is_terminal()
                && new_status != TicketStatus::Reopened
            {
                return IngestOutcome::Stale;
            }
            if view.status == new_status {
                return IngestOutcome::Unchanged;
            }
            view.status = new_status;
            if let Some(changed_at) = stamped {
                view.status_changed_at =
                    Some(view.status_changed_at.map_or(changed_at, |last| last.max(changed_at)));
            }
            view.updated_at = view.updated_at.max(at);
            IngestOutcome::Updated
        })?;
        let outcome = outcome.ok_or_else(|| EngineError::unknown_ticket(key, &ticket_id))?;
        if outcome == IngestOutcome::Stale {
            debug!(%ticket_id, status = %new_status, "Stale status change ignored");
        }
        Ok((ticket_id, outcome))
    }

    /// `ticket.escalated`: record the target handler and ESCALATED status.
    ///
    /// A resolved or closed ticket is left untouched.
    pub fn apply_escalated(
        &self,
        event: &TicketEscalated,
        now: DateTime<Utc>,
    ) -> EngineResult<(TicketId, IngestOutcome)> {
        let key = routing::TICKET_ESCALATED;
        let ticket_id = self.resolve_keys(key, &event.ticket_id, &event.ticket_number)?;
        let target = event
            .escalated_to_user_id
            .as_deref()
            .ok_or_else(|| EngineError::malformed(key, "missing escalatedToUserId"))?;
        let at = event.escalated_at.unwrap_or(now);

        let outcome = self.store.update_ticket(&ticket_id, |view| {
            if view.status.is_terminal() {
                return IngestOutcome::Unchanged;
            }
            if view.assigned_agent.as_deref() == Some(target)
                && view.status == TicketStatus::Escalated
            {
                return IngestOutcome::Unchanged;
            }
            view.assigned_agent = Some(target.to_string());
            view.status = TicketStatus::Escalated;
            view.updated_at = view.updated_at.max(at);
            IngestOutcome::Updated
        })?;
        let outcome = outcome.ok_or_else(|| EngineError::unknown_ticket(key, &ticket_id))?;
        Ok((ticket_id, outcome))
    }

    /// `ticket.priority.changed`: priority (and category, if given) arrive
    /// after creation
    pub fn apply_priority(
        &self,
        event: &TicketPriorityChanged,
        now: DateTime<Utc>,
    ) -> EngineResult<(TicketId, IngestOutcome)> {
        let key = routing::TICKET_PRIORITY_CHANGED;
        let ticket_id = self.resolve_keys(key, &event.ticket_id, &event.ticket_number)?;
        let priority = event
            .priority
            .ok_or_else(|| EngineError::malformed(key, "missing priority"))?;
        let at = event.changed_at.unwrap_or(now);

        let outcome = self.store.update_ticket(&ticket_id, |view| {
            let category = event.category.clone().or_else(|| view.category.clone());
            if view.priority == Some(priority) && view.category == category {
                return IngestOutcome::Unchanged;
            }
            view.priority = Some(priority);
            view.category = category;
            view.updated_at = view.updated_at.max(at);
            IngestOutcome::Updated
        })?;
        let outcome = outcome.ok_or_else(|| EngineError::unknown_ticket(key, &ticket_id))?;
        Ok((ticket_id, outcome))
    }
}
